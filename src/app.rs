use crate::{
    color::{self, ColormapKind, COLORMAP_SIZE},
    config::Settings,
    error::LayerError,
    histogram::{histogram, Histogram},
    layer::{convert_wav_dir, list_layers, read_meta, CHANNELS},
    loader::{LoadOrchestrator, LoadRequest},
    mock::{write_mock_layers, MockOptions},
    points::PointCloud,
    render::RenderEngine,
};
use anyhow::Context as _;
use eframe::egui;
use egui_plot::{Line, Plot, PlotPoints, VLine};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
};

type LayerJob = JoinHandle<Result<Vec<PathBuf>, LayerError>>;

#[derive(Clone, Debug)]
struct ScreenshotRequest {
    path: PathBuf,
    crop_px: Option<[u32; 4]>,
}

/// Progress reported by a background layer job.
#[derive(Default)]
struct JobProgress {
    label: String,
    done: usize,
    total: usize,
}

pub struct WavecloudApp {
    settings: Settings,
    engine: RenderEngine,
    loader: LoadOrchestrator,
    /// Set when the render engine could not be built. Nothing is drawn.
    fatal: Option<String>,

    layer_dir: PathBuf,
    layers: Vec<PathBuf>,
    /// 1-based, as shown in the UI.
    layer_index: usize,
    /// Header summary of the selected layer, refreshed when the selection changes.
    layer_summary: Option<String>,
    stack_count: usize,
    channel: String,
    stride: usize,
    point_size: f32,
    value_range: (f32, f32),
    colormap: ColormapKind,

    histogram: Option<Histogram>,
    histogram_handle: Option<JoinHandle<Result<Histogram, LayerError>>>,

    layer_job: Option<LayerJob>,
    job_progress: Arc<Mutex<JobProgress>>,
    mock_layers: usize,

    viewport_rect: egui::Rect,
    status: Option<String>,
    last_error: Option<String>,
}

impl WavecloudApp {
    pub fn new(cc: &eframe::CreationContext<'_>, settings: Settings) -> Self {
        let ctx = cc.egui_ctx.clone();
        let mut engine = RenderEngine::new();
        let mut fatal = None;
        match cc.wgpu_render_state.as_ref() {
            Some(rs) => {
                let info = rs.adapter.get_info();
                log::info!("adapter: {} ({:?}, {:?})", info.name, info.device_type, info.backend);
                engine.attach(rs.clone(), ctx.clone());
            }
            None => fatal = Some("eframe was started without the wgpu renderer".to_string()),
        }
        engine.set_points(PointCloud::demo_cross());
        engine.set_point_size(settings.point_size);
        engine.set_value_range(settings.value_min, settings.value_max);
        if fatal.is_none() {
            if let Err(err) = engine.initialize() {
                fatal = Some(err.to_string());
            }
        }

        let waker_ctx = ctx.clone();
        let loader = LoadOrchestrator::new().with_waker(Arc::new(move || waker_ctx.request_repaint()));

        let mut app = Self {
            layer_dir: settings.layer_dir.clone(),
            layers: Vec::new(),
            layer_index: 1,
            layer_summary: None,
            stack_count: 1,
            channel: settings.channel.clone(),
            stride: settings.stride.max(1),
            point_size: settings.point_size,
            value_range: (settings.value_min, settings.value_max),
            colormap: ColormapKind::default(),

            histogram: None,
            histogram_handle: None,

            layer_job: None,
            job_progress: Arc::new(Mutex::new(JobProgress::default())),
            mock_layers: 5,

            viewport_rect: egui::Rect::NOTHING,
            status: None,
            last_error: None,

            settings,
            engine,
            loader,
            fatal,
        };
        app.refresh_layers(&ctx);
        app
    }

    fn refresh_layers(&mut self, ctx: &egui::Context) {
        self.layers = list_layers(&self.layer_dir);
        self.layer_index = self.layer_index.clamp(1, self.layers.len().max(1));
        log::info!("{} layers in {}", self.layers.len(), self.layer_dir.display());
        self.select_layer();
        self.start_histogram(ctx);
    }

    fn select_layer(&mut self) {
        self.layer_summary = self
            .layers
            .get(self.layer_index.saturating_sub(1))
            .and_then(|path| layer_summary(path));
    }

    fn choose_folder(&mut self, ctx: &egui::Context) {
        let Some(dir) = rfd::FileDialog::new()
            .set_title("Select layer folder")
            .set_directory(&self.layer_dir)
            .pick_folder()
        else {
            return;
        };
        self.layer_dir = dir;
        self.refresh_layers(ctx);
    }

    fn start_histogram(&mut self, ctx: &egui::Context) {
        let dir = self.layer_dir.clone();
        let channel = self.channel.clone();
        let bins = self.settings.histogram_bins;
        let ctx = ctx.clone();
        // A running job is left to finish; its handle is replaced and dropped.
        self.histogram_handle = Some(thread::spawn(move || {
            let hist = histogram(&dir, &channel, bins);
            ctx.request_repaint();
            hist
        }));
    }

    fn poll_histogram(&mut self) {
        let Some(handle) = self.histogram_handle.as_ref() else {
            return;
        };
        if !handle.is_finished() {
            return;
        }
        let Some(handle) = self.histogram_handle.take() else {
            return;
        };
        match handle.join() {
            Ok(Ok(hist)) => self.histogram = Some(hist),
            Ok(Err(err)) => {
                log::warn!("histogram failed: {err}");
                self.histogram = None;
                self.last_error = Some(format!("Histogram failed: {err}"));
            }
            Err(_) => self.last_error = Some("Histogram thread panicked.".to_string()),
        }
    }

    fn recalculate(&mut self) {
        let Some(request) = load_request(&self.layers, self.layer_index, self.stack_count, &self.channel, self.stride)
        else {
            self.last_error = Some(format!("No layer files in {}", self.layer_dir.display()));
            return;
        };
        self.status = Some(format!("Calculating {}", request.describe()));
        self.last_error = None;
        self.loader.request(request);
    }

    fn poll_loader(&mut self) {
        match self.loader.poll() {
            Some(Ok(cloud)) => {
                self.status = Some(match cloud.value_range() {
                    Some((lo, hi)) => format!("Loaded {} points, values {lo} .. {hi}", cloud.len()),
                    None => format!("Loaded {} points", cloud.len()),
                });
                self.engine.set_points(cloud);
            }
            Some(Err(err)) => {
                self.status = None;
                self.last_error = Some(format!("Load failed: {err}"));
            }
            None => {}
        }
    }

    fn start_layer_job<F>(&mut self, label: &str, job: F)
    where
        F: FnOnce(Arc<Mutex<JobProgress>>) -> Result<Vec<PathBuf>, LayerError> + Send + 'static,
    {
        if self.layer_job.is_some() {
            return;
        }
        *self.job_progress.lock() = JobProgress {
            label: label.to_string(),
            ..Default::default()
        };
        let progress = self.job_progress.clone();
        self.layer_job = Some(thread::spawn(move || job(progress)));
    }

    fn convert_wavs(&mut self, ctx: &egui::Context) {
        let Some(wav_dir) = rfd::FileDialog::new()
            .set_title("Select folder with .wav recordings")
            .pick_folder()
        else {
            return;
        };
        let out_dir = self.layer_dir.clone();
        let ctx = ctx.clone();
        self.start_layer_job("Creating layer files", move |progress| {
            convert_wav_dir(&wav_dir, &out_dir, |done, total, _| {
                let mut p = progress.lock();
                p.done = done;
                p.total = total;
                ctx.request_repaint();
            })
        });
    }

    fn generate_mock(&mut self) {
        let out_dir = self.layer_dir.clone();
        let opts = MockOptions {
            layers: self.mock_layers,
            ..Default::default()
        };
        self.start_layer_job("Generating mock layers", move |progress| {
            progress.lock().total = opts.layers;
            write_mock_layers(&out_dir, &opts)
        });
    }

    fn poll_layer_job(&mut self, ctx: &egui::Context) {
        let Some(handle) = self.layer_job.as_ref() else {
            return;
        };
        if !handle.is_finished() {
            return;
        }
        let Some(handle) = self.layer_job.take() else {
            return;
        };
        match handle.join() {
            Ok(Ok(written)) => {
                self.status = Some(format!("{} layer files written", written.len()));
                self.refresh_layers(ctx);
            }
            Ok(Err(err)) => self.last_error = Some(format!("Layer creation failed: {err}")),
            Err(_) => self.last_error = Some("Layer thread panicked.".to_string()),
        }
    }

    fn request_export(&mut self, ctx: &egui::Context) {
        let ppp = ctx.pixels_per_point();
        let r = self.viewport_rect;
        let crop_px = (r.width() > 0.0 && r.height() > 0.0).then(|| {
            [
                (r.min.x * ppp).round() as u32,
                (r.min.y * ppp).round() as u32,
                (r.width() * ppp).round() as u32,
                (r.height() * ppp).round() as u32,
            ]
        });
        let req = ScreenshotRequest {
            path: self.settings.export_path.clone(),
            crop_px,
        };
        ctx.send_viewport_cmd(egui::ViewportCommand::Screenshot(egui::UserData::new(req)));
    }

    fn handle_screenshot_events(&mut self, ctx: &egui::Context) {
        let events = ctx.input(|i| i.events.clone());
        for ev in events {
            let egui::Event::Screenshot { image, user_data, .. } = ev else {
                continue;
            };
            let Some(req) = user_data
                .data
                .as_ref()
                .and_then(|u| u.downcast_ref::<ScreenshotRequest>().cloned())
            else {
                continue;
            };
            match save_color_image_png(&image, &req.path, req.crop_px) {
                Ok(()) => {
                    log::info!("export successful: {}", req.path.display());
                    self.status = Some(format!("Exported {}", req.path.display()));
                }
                Err(err) => {
                    log::error!("export failed: {err:#}");
                    self.last_error = Some(format!("Export failed: {err:#}"));
                }
            }
        }
    }

    fn ui_side_panel(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        ui.heading("wavecloud");

        ui.separator();
        ui.label("Layers");
        ui.label(self.layer_dir.display().to_string());
        ui.horizontal(|ui| {
            if ui.button("Choose folder…").clicked() {
                self.choose_folder(ctx);
            }
            if ui.button("Rescan").clicked() {
                self.refresh_layers(ctx);
            }
        });
        ui.label(format!("{} layer files", self.layers.len()));
        if let Some(summary) = &self.layer_summary {
            ui.small(summary.as_str());
        }

        let job_running = self.layer_job.is_some();
        ui.add_enabled_ui(!job_running, |ui| {
            if ui.button("Create layer files from WAV…").clicked() {
                self.convert_wavs(ctx);
            }
            ui.horizontal(|ui| {
                ui.add(egui::DragValue::new(&mut self.mock_layers).range(1..=64).suffix(" layers"));
                if ui.button("Generate mock").clicked() {
                    self.generate_mock();
                }
            });
        });
        if job_running {
            let p = self.job_progress.lock();
            ui.horizontal(|ui| {
                ui.spinner();
                ui.label(format!("{} ({}/{})", p.label, p.done, p.total));
            });
        }

        ui.separator();
        ui.label("Calculation");
        let n_layers = self.layers.len().max(1);
        let layer = ui.add(egui::Slider::new(&mut self.layer_index, 1..=n_layers).text("Layer"));
        if layer.changed() {
            self.select_layer();
        }
        let stack = ui.add(egui::Slider::new(&mut self.stack_count, 1..=n_layers).text("Stack"));
        let mut settled = released(&layer) || released(&stack);
        let mut channel_changed = false;
        egui::ComboBox::from_label("Channel")
            .selected_text(self.channel.as_str())
            .show_ui(ui, |ui| {
                for ch in CHANNELS {
                    channel_changed |= ui.selectable_value(&mut self.channel, ch.to_string(), ch).changed();
                }
            });
        if channel_changed {
            self.start_histogram(ctx);
        }
        let stride = ui.add(egui::DragValue::new(&mut self.stride).range(1..=10_000).prefix("every nth row: "));
        settled |= channel_changed || released(&stride);
        if settled && !self.layers.is_empty() {
            self.recalculate();
        }
        ui.horizontal(|ui| {
            if ui.button("Recalculate").clicked() {
                self.recalculate();
            }
            if self.loader.is_busy() {
                ui.spinner();
                ui.label("Calculation started");
            }
        });

        ui.separator();
        ui.label("Display");
        if ui
            .add(egui::Slider::new(&mut self.point_size, 0.5..=20.0).text("Point size"))
            .changed()
        {
            self.engine.set_point_size(self.point_size);
        }
        let (lo, hi) = self
            .histogram
            .as_ref()
            .and_then(Histogram::value_range)
            .unwrap_or((0.0, 32767.0));
        let speed = ((hi - lo) / 500.0).max(1.0);
        let mut range_changed = false;
        ui.horizontal(|ui| {
            ui.label("Energy");
            range_changed |= ui.add(egui::DragValue::new(&mut self.value_range.0).speed(speed)).changed();
            ui.label("..");
            range_changed |= ui.add(egui::DragValue::new(&mut self.value_range.1).speed(speed)).changed();
        });
        if range_changed {
            self.engine.set_value_range(self.value_range.0, self.value_range.1);
        }

        egui::ComboBox::from_label("Colormap")
            .selected_text(self.colormap.label())
            .show_ui(ui, |ui| {
                for kind in ColormapKind::ALL {
                    ui.selectable_value(&mut self.colormap, kind, kind.label());
                }
            });
        self.engine.set_colormap(self.colormap);
        draw_colormap_legend(ui, self.colormap, self.value_range);

        ui.horizontal(|ui| {
            if ui.button("Reset view").clicked() {
                self.engine.reset_view();
            }
            if ui.button("Export").clicked() {
                self.request_export(ctx);
            }
        });

        ui.separator();
        ui.label("Histogram");
        self.ui_histogram(ui);

        if let Some(msg) = &self.status {
            ui.separator();
            ui.label(msg);
        }
        if let Some(err) = &self.last_error {
            ui.colored_label(egui::Color32::from_rgb(230, 90, 90), err);
        }
    }

    fn ui_histogram(&self, ui: &mut egui::Ui) {
        if self.histogram_handle.is_some() {
            ui.spinner();
        }
        let Some(hist) = self.histogram.as_ref().filter(|h| !h.is_empty()) else {
            ui.label("No data");
            return;
        };
        let points: Vec<[f64; 2]> = hist
            .bins()
            .iter()
            .filter(|(v, _)| v.is_finite())
            .map(|&(v, c)| [v as f64, c as f64])
            .collect();
        Plot::new("histogram")
            .height(180.0)
            .allow_scroll(false)
            .show(ui, |plot_ui| {
                plot_ui.line(Line::new(self.channel.as_str(), PlotPoints::from(points)));
                plot_ui.vline(VLine::new("min", self.value_range.0 as f64));
                plot_ui.vline(VLine::new("max", self.value_range.1 as f64));
            });
        ui.small(format!("{} points, {} values", hist.total(), hist.bins().len()));
    }

    fn ui_viewport(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        let (rect, response) = ui.allocate_exact_size(ui.available_size(), egui::Sense::click_and_drag());
        self.viewport_rect = rect;

        if let Some(msg) = &self.fatal {
            ui.painter().rect_filled(rect, 0.0, egui::Color32::BLACK);
            ui.painter().text(
                rect.center(),
                egui::Align2::CENTER_CENTER,
                format!("Rendering unavailable\n{msg}"),
                egui::FontId::monospace(13.0),
                egui::Color32::from_rgb(230, 90, 90),
            );
            return;
        }

        self.engine.handle_input(ctx, &response);
        if response.double_clicked() {
            self.engine.reset_view();
        }
        self.engine.render(ui, rect);

        let view = self.engine.view();
        ui.painter().text(
            rect.left_top() + egui::vec2(8.0, 8.0),
            egui::Align2::LEFT_TOP,
            format!("{} points | zoom {:.2}", self.engine.point_count(), view.zoom),
            egui::FontId::monospace(11.0),
            egui::Color32::from_gray(200),
        );
    }
}

impl Drop for WavecloudApp {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

impl eframe::App for WavecloudApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.handle_screenshot_events(ctx);
        self.poll_loader();
        self.poll_histogram();
        self.poll_layer_job(ctx);

        egui::SidePanel::left("left_panel")
            .resizable(true)
            .default_width(300.0)
            .max_width(460.0)
            .show(ctx, |ui| {
                egui::ScrollArea::vertical().auto_shrink([false; 2]).show(ui, |ui| {
                    self.ui_side_panel(ui, ctx);
                });
            });

        egui::CentralPanel::default()
            .frame(egui::Frame::NONE)
            .show(ctx, |ui| {
                self.ui_viewport(ui, ctx);
            });

        if self.layer_job.is_some() || self.histogram_handle.is_some() {
            ctx.request_repaint_after(std::time::Duration::from_millis(100));
        }
    }
}

fn draw_colormap_legend(ui: &mut egui::Ui, kind: ColormapKind, range: (f32, f32)) {
    let table = color::colormap(kind, COLORMAP_SIZE);
    let (rect, _) = ui.allocate_exact_size(egui::vec2(180.0, 14.0), egui::Sense::hover());
    let steps = 32;
    let seg_w = rect.width() / steps as f32;
    for i in 0..steps {
        let t = i as f32 / (steps - 1) as f32;
        let [r, g, b, _] = color::to_rgba8(color::sample(&table, t));
        let x0 = rect.left() + seg_w * i as f32;
        let seg = egui::Rect::from_min_size(egui::pos2(x0, rect.top()), egui::vec2(seg_w + 1.0, rect.height()));
        ui.painter().rect_filled(seg, 0.0, egui::Color32::from_rgb(r, g, b));
    }
    ui.small(format!("{:.0} .. {:.0}", range.0, range.1));
}

/// Writes `img` (optionally cropped to `[x, y, w, h]` pixels) as a PNG.
/// One-line description of a layer file from its header.
fn layer_summary(path: &Path) -> Option<String> {
    match read_meta(path) {
        Ok(meta) => {
            let source = meta.source.as_deref().unwrap_or("unknown source");
            Some(format!("{} points from {source}", meta.n_points))
        }
        Err(err) => {
            log::debug!("no summary for {}: {err}", path.display());
            None
        }
    }
}

/// True once a slider or drag value has settled on a new value: the drag
/// ended, or it changed by click or keyboard without dragging.
fn released(response: &egui::Response) -> bool {
    response.drag_stopped() || (response.changed() && !response.dragged())
}

/// What to load for the 1-based `layer_index` and `stack_count` layers from
/// it. One layer is read directly; more are stacked. `None` without layers.
fn load_request(
    layers: &[PathBuf],
    layer_index: usize,
    stack_count: usize,
    channel: &str,
    stride: usize,
) -> Option<LoadRequest> {
    if layers.is_empty() {
        return None;
    }
    let start = layer_index.clamp(1, layers.len()) - 1;
    let end = (start + stack_count.max(1)).min(layers.len());
    let channel = channel.to_string();
    Some(if end - start == 1 {
        LoadRequest::Layer {
            path: layers[start].clone(),
            channel,
            stride,
        }
    } else {
        LoadRequest::Stack {
            paths: layers[start..end].to_vec(),
            channel,
            stride,
        }
    })
}

fn save_color_image_png(img: &egui::ColorImage, path: &Path, crop_px: Option<[u32; 4]>) -> anyhow::Result<()> {
    use image::ImageEncoder;

    let w = img.size[0] as u32;
    let h = img.size[1] as u32;

    let (x0, y0, cw, ch) = match crop_px {
        Some(crop) => {
            let x = crop[0].min(w);
            let y = crop[1].min(h);
            let cw = crop[2].min(w.saturating_sub(x));
            let ch = crop[3].min(h.saturating_sub(y));
            if cw == 0 || ch == 0 {
                (0, 0, w, h)
            } else {
                (x, y, cw, ch)
            }
        }
        None => (0, 0, w, h),
    };

    let mut rgba = Vec::with_capacity((cw * ch * 4) as usize);
    for row in 0..ch {
        let base = (y0 + row) as usize * w as usize + x0 as usize;
        for p in &img.pixels[base..base + cw as usize] {
            rgba.extend_from_slice(&p.to_array());
        }
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let encoder = image::codecs::png::PngEncoder::new_with_quality(
        file,
        image::codecs::png::CompressionType::Best,
        image::codecs::png::FilterType::Adaptive,
    );
    encoder.write_image(&rgba, cw, ch, image::ExtendedColorType::Rgba8)?;
    Ok(())
}
