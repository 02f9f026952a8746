//! Off-thread loading with last-started-wins delivery.

use crate::{
    error::LoadError,
    layer::scan_layer,
    merge::merge_summed_all,
    normalize::normalize,
    points::{Point, PointCloud},
};
use std::{
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

#[derive(Clone, Debug, PartialEq)]
pub enum LoadRequest {
    /// One layer, projected on `channel` and thinned to every `stride`-th row.
    Layer {
        path: PathBuf,
        channel: String,
        stride: usize,
    },
    /// Several layers summed per coordinate and divided by the layer count.
    Stack {
        paths: Vec<PathBuf>,
        channel: String,
        stride: usize,
    },
}

impl LoadRequest {
    pub fn describe(&self) -> String {
        match self {
            LoadRequest::Layer { path, channel, stride } => {
                format!("{} [{channel}, stride {stride}]", path.display())
            }
            LoadRequest::Stack { paths, channel, stride } => {
                format!("{} stacked layers [{channel}, stride {stride}]", paths.len())
            }
        }
    }
}

pub type LoadOutcome = Result<PointCloud, LoadError>;

/// Called from the worker after its result is queued, e.g. to wake the UI.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// Runs `request` on the calling thread.
pub fn run_request(request: &LoadRequest) -> LoadOutcome {
    match request {
        LoadRequest::Layer { path, channel, stride } => {
            let scan = scan_layer(path, channel, *stride)?;
            Ok(normalize(scan.rows()).collect())
        }
        LoadRequest::Stack { paths, channel, stride } => {
            if paths.is_empty() {
                return Err(LoadError::Empty);
            }
            let mut sets: Vec<Vec<Point>> = Vec::with_capacity(paths.len());
            for path in paths {
                let scan = scan_layer(path, channel, *stride)?;
                let mut points = Vec::with_capacity(scan.len());
                points.extend(scan.rows().map(Point::from));
                sets.push(points);
            }
            let refs: Vec<&[Point]> = sets.iter().map(Vec::as_slice).collect();
            let merged = merge_summed_all(&refs, paths.len() as f32)?;
            Ok(normalize(merged.iter().map(|p| [p.x, p.y, p.value])).collect())
        }
    }
}

pub struct LoadOrchestrator {
    generation: u64,
    delivered: u64,
    tx: Sender<(u64, LoadOutcome)>,
    rx: Receiver<(u64, LoadOutcome)>,
    latest: Option<JoinHandle<()>>,
    waker: Option<Waker>,
}

impl Default for LoadOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadOrchestrator {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            generation: 0,
            delivered: 0,
            tx,
            rx,
            latest: None,
            waker: None,
        }
    }

    pub fn with_waker(mut self, waker: Waker) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Starts `request` on a new worker and makes it the only one whose
    /// result will be delivered. Returns its generation.
    pub fn request(&mut self, request: LoadRequest) -> u64 {
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        let waker = self.waker.clone();
        log::info!("load #{generation} started: {}", request.describe());

        self.latest = Some(thread::spawn(move || {
            let started = Instant::now();
            let outcome = run_request(&request);
            match &outcome {
                Ok(cloud) => log::info!(
                    "load #{generation} finished: {} points in {:.2?}",
                    cloud.len(),
                    started.elapsed()
                ),
                Err(err) => log::warn!("load #{generation} failed: {err}"),
            }
            // The receiver only goes away with the orchestrator.
            let _ = tx.send((generation, outcome));
            if let Some(wake) = waker {
                wake();
            }
        }));
        generation
    }

    pub fn is_busy(&self) -> bool {
        self.delivered < self.generation
    }

    /// Drains finished workers and returns the latest request's outcome
    /// once it arrives. Results of superseded requests are dropped.
    pub fn poll(&mut self) -> Option<LoadOutcome> {
        let worker_done = self.latest.as_ref().is_some_and(|h| h.is_finished());

        let mut latest = None;
        while let Ok((generation, outcome)) = self.rx.try_recv() {
            if generation == self.generation {
                latest = Some(outcome);
            } else {
                log::debug!("discarding stale load #{generation} (latest #{})", self.generation);
            }
        }

        if latest.is_some() {
            self.delivered = self.generation;
            self.latest = None;
            return latest;
        }
        if worker_done && self.is_busy() {
            // Finished without sending: the worker panicked.
            self.delivered = self.generation;
            self.latest = None;
            return Some(Err(LoadError::WorkerLost));
        }
        None
    }
}
