//! Columnar layer files.
//!
//! A layer file is a small JSON header followed by one little-endian `f32`
//! block per column:
//!
//! ```text
//! [u64 LE json_len][json metadata][zero pad to 16 bytes][column blocks...]
//! ```
//!
//! Column offsets in the metadata are relative to the start of the data
//! section. Files are memory mapped on read, so a scan only touches the
//! pages of the projected columns.

use crate::error::LayerError;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fs::{self, File},
    io::{BufWriter, Write},
    ops::Range,
    path::{Path, PathBuf},
};

pub const LAYER_EXTENSION: &str = "layer";
pub const WAV_EXTENSION: &str = "wav";
pub const CHANNELS: [&str; 4] = ["channel_1", "channel_2", "channel_3", "channel_4"];
pub const COLUMNS: [&str; 6] = ["x", "y", "channel_1", "channel_2", "channel_3", "channel_4"];

const FORMAT_VERSION: u32 = 1;
const HEADER_ALIGN: usize = 16;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub offset: u64,
    pub len_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LayerMeta {
    pub version: u32,
    pub n_points: u64,
    pub columns: Vec<ColumnMeta>,
    /// Recording the layer was converted from, if any.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

impl LayerMeta {
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Interleaved multi-channel samples, `rows x channels`.
#[derive(Clone, Debug, Default)]
pub struct RawSamples {
    channels: usize,
    data: Vec<f32>,
    sample_rate: Option<u32>,
    source: Option<String>,
}

impl RawSamples {
    pub fn new(channels: usize, data: Vec<f32>) -> Self {
        Self {
            channels,
            data,
            sample_rate: None,
            source: None,
        }
    }

    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn rows(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels
        }
    }

    fn column(&self, idx: usize) -> impl Iterator<Item = f32> + '_ {
        self.data
            .chunks_exact(self.channels)
            .map(move |row| row[idx])
    }
}

pub fn layer_file_name(layer_index: usize) -> String {
    format!("Layer_{layer_index}.{LAYER_EXTENSION}")
}

/// Converts raw samples into the layer schema and writes
/// `out_dir/Layer_{layer_index}.layer`.
///
/// The last four raw channels carry the stage position: `x` is channel
/// `n-4`, `y` is channel `n-3`. The first four raw channels become
/// `channel_1..channel_4`.
pub fn write_layer(raw: &RawSamples, out_dir: &Path, layer_index: usize) -> Result<PathBuf, LayerError> {
    let width = raw.channels();
    if width < 4 {
        return Err(LayerError::ChannelCount { found: width });
    }
    fs::create_dir_all(out_dir).map_err(|e| LayerError::Io {
        path: out_dir.to_path_buf(),
        source: e,
    })?;

    let sources = [width - 4, width - 3, 0, 1, 2, 3];
    let n_points = raw.rows() as u64;
    let col_bytes = n_points * 4;
    let columns = COLUMNS
        .iter()
        .enumerate()
        .map(|(i, name)| ColumnMeta {
            name: (*name).to_string(),
            offset: i as u64 * col_bytes,
            len_bytes: col_bytes,
        })
        .collect();
    let meta = LayerMeta {
        version: FORMAT_VERSION,
        n_points,
        columns,
        source: raw.source.clone(),
        sample_rate: raw.sample_rate,
    };
    let json = serde_json::to_vec(&meta).map_err(|e| LayerError::format(out_dir, e.to_string()))?;

    let out_file = out_dir.join(layer_file_name(layer_index));
    let tmp_file = out_file.with_extension("layer.tmp");
    let write = || -> std::io::Result<()> {
        let mut w = BufWriter::new(File::create(&tmp_file)?);
        w.write_all(&(json.len() as u64).to_le_bytes())?;
        w.write_all(&json)?;
        let json_end = 8 + json.len();
        let pad = (HEADER_ALIGN - json_end % HEADER_ALIGN) % HEADER_ALIGN;
        w.write_all(&[0u8; HEADER_ALIGN][..pad])?;
        for &src in &sources {
            for v in raw.column(src) {
                w.write_all(&v.to_le_bytes())?;
            }
        }
        w.flush()?;
        Ok(())
    };
    write().map_err(|e| LayerError::io(&tmp_file, e))?;
    fs::rename(&tmp_file, &out_file).map_err(|e| LayerError::io(&out_file, e))?;
    Ok(out_file)
}

/// A memory-mapped layer file with validated metadata.
pub struct LayerFile {
    path: PathBuf,
    mmap: Mmap,
    data_start: usize,
    pub meta: LayerMeta,
}

impl LayerFile {
    pub fn open(path: &Path) -> Result<Self, LayerError> {
        let file = File::open(path).map_err(|e| LayerError::io(path, e))?;
        // SAFETY: layer files are written once and never modified in place.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| LayerError::io(path, e))?;

        if mmap.len() < 8 {
            return Err(LayerError::format(path, "file too small"));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[0..8]);
        let json_len = u64::from_le_bytes(len_bytes) as usize;
        let json_end = 8usize
            .checked_add(json_len)
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| LayerError::format(path, "invalid json_len"))?;

        let meta: LayerMeta = serde_json::from_slice(&mmap[8..json_end])
            .map_err(|e| LayerError::format(path, format!("metadata: {e}")))?;
        if meta.version != FORMAT_VERSION {
            return Err(LayerError::format(path, format!("unsupported version {}", meta.version)));
        }

        let pad = (HEADER_ALIGN - json_end % HEADER_ALIGN) % HEADER_ALIGN;
        let data_start = json_end + pad;
        if mmap.len() < data_start {
            return Err(LayerError::format(path, "invalid padding/data_start"));
        }

        let layer = Self {
            path: path.to_path_buf(),
            mmap,
            data_start,
            meta,
        };
        let col_bytes = layer
            .meta
            .n_points
            .checked_mul(4)
            .ok_or_else(|| LayerError::format(path, "n_points out of range"))?;
        for col in &layer.meta.columns {
            if col.len_bytes != col_bytes {
                return Err(LayerError::format(
                    path,
                    format!("column `{}` length does not match n_points", col.name),
                ));
            }
            layer.column_range(col)?;
        }
        Ok(layer)
    }

    pub fn n_points(&self) -> usize {
        self.meta.n_points as usize
    }

    fn column_range(&self, col: &ColumnMeta) -> Result<Range<usize>, LayerError> {
        let out_of_bounds = || LayerError::format(&self.path, format!("column `{}` out of bounds", col.name));
        let offset = usize::try_from(col.offset).map_err(|_| out_of_bounds())?;
        let len = usize::try_from(col.len_bytes).map_err(|_| out_of_bounds())?;
        let start = self.data_start.checked_add(offset).ok_or_else(out_of_bounds)?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.mmap.len())
            .ok_or_else(out_of_bounds)?;
        bytemuck::try_cast_slice::<u8, f32>(&self.mmap[start..end])
            .map_err(|e| LayerError::format(&self.path, format!("column `{}`: {e:?}", col.name)))?;
        Ok(start..end)
    }

    fn resolve(&self, name: &str) -> Result<Range<usize>, LayerError> {
        let col = self.meta.column(name).ok_or_else(|| LayerError::Schema {
            path: self.path.clone(),
            column: name.to_string(),
        })?;
        self.column_range(col)
    }

    /// Whole column as a borrowed slice. Columns are stored little-endian,
    /// matching every target this viewer runs on.
    pub fn column(&self, name: &str) -> Result<&[f32], LayerError> {
        let range = self.resolve(name)?;
        Ok(bytemuck::cast_slice(&self.mmap[range]))
    }
}

/// Projection of `x`, `y` and one channel with row striding. Iterating
/// does not copy the layer; `rows()` can be called repeatedly.
pub struct LayerScan {
    file: LayerFile,
    x: Range<usize>,
    y: Range<usize>,
    value: Range<usize>,
    stride: usize,
}

impl LayerScan {
    pub fn rows(&self) -> impl Iterator<Item = [f32; 3]> + Clone + '_ {
        let x: &[f32] = bytemuck::cast_slice(&self.file.mmap[self.x.clone()]);
        let y: &[f32] = bytemuck::cast_slice(&self.file.mmap[self.y.clone()]);
        let v: &[f32] = bytemuck::cast_slice(&self.file.mmap[self.value.clone()]);
        x.iter()
            .zip(y)
            .zip(v)
            .step_by(self.stride)
            .map(|((&x, &y), &v)| [x, y, v])
    }

    /// Number of rows `rows()` yields.
    pub fn len(&self) -> usize {
        self.file.n_points().div_ceil(self.stride)
    }
}

/// Opens `path` for a projected, strided read of `x`, `y` and `channel`.
/// Keeps row 0 and then every `stride`-th row; a stride of 0 reads every row.
pub fn scan_layer(path: &Path, channel: &str, stride: usize) -> Result<LayerScan, LayerError> {
    let file = LayerFile::open(path)?;
    let x = file.resolve("x")?;
    let y = file.resolve("y")?;
    let value = file.resolve(channel)?;
    Ok(LayerScan {
        file,
        x,
        y,
        value,
        stride: stride.max(1),
    })
}

/// Reads only the metadata header of a layer file.
pub fn read_meta(path: &Path) -> Result<LayerMeta, LayerError> {
    Ok(LayerFile::open(path)?.meta)
}

fn list_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("{} is not a readable directory: {err}", dir.display());
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(ext))
        })
        .collect();
    files.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
    files
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Layer files in `dir`, in natural order (`Layer_2` before `Layer_10`).
pub fn list_layers(dir: &Path) -> Vec<PathBuf> {
    list_with_extension(dir, LAYER_EXTENSION)
}

pub fn list_wav_files(dir: &Path) -> Vec<PathBuf> {
    list_with_extension(dir, WAV_EXTENSION)
}

/// Compares strings treating runs of ASCII digits as numbers.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) if ca.is_ascii_digit() && cb.is_ascii_digit() => {
                let na = take_digits(&mut a);
                let nb = take_digits(&mut b);
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta
                    .len()
                    .cmp(&tb.len())
                    .then_with(|| ta.cmp(tb))
                    .then_with(|| na.len().cmp(&nb.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(ca), Some(cb)) => {
                let ord = ca.cmp(&cb);
                if ord != Ordering::Equal {
                    return ord;
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_digits(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = it.next_if(|c| c.is_ascii_digit()) {
        digits.push(c);
    }
    digits
}

/// Decodes a wav recording. Integer PCM keeps its integer value (no
/// rescaling into [-1, 1]).
pub fn read_raw_wav(path: &Path) -> Result<RawSamples, LayerError> {
    let wav_err = |source: hound::Error| match source {
        hound::Error::IoError(e) => LayerError::io(path, e),
        source => LayerError::Wav {
            path: path.to_path_buf(),
            source,
        },
    };
    let mut reader = hound::WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();
    let data: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(wav_err)?,
        hound::SampleFormat::Int => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32))
            .collect::<Result<_, _>>()
            .map_err(wav_err)?,
    };
    Ok(RawSamples::new(spec.channels as usize, data)
        .with_sample_rate(spec.sample_rate)
        .with_source(path.display().to_string()))
}

/// Converts every wav file in `wav_dir` to `out_dir/Layer_{i}.layer`, with
/// `i` the 1-based natural-order position. `on_layer(done, total, path)` is
/// called after each layer is written.
pub fn convert_wav_dir(
    wav_dir: &Path,
    out_dir: &Path,
    mut on_layer: impl FnMut(usize, usize, &Path),
) -> Result<Vec<PathBuf>, LayerError> {
    let wavs = list_wav_files(wav_dir);
    let total = wavs.len();
    let mut written = Vec::with_capacity(total);
    for (i, wav) in wavs.iter().enumerate() {
        let raw = read_raw_wav(wav)?;
        let out = write_layer(&raw, out_dir, i + 1)?;
        log::info!("Layer {} created from {} ({} rows)", i + 1, wav.display(), raw.rows());
        on_layer(i + 1, total, &out);
        written.push(out);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, channels: usize) -> RawSamples {
        let data = (0..rows * channels).map(|i| i as f32).collect();
        RawSamples::new(channels, data)
    }

    #[test]
    fn hundred_rows_stride_ten_yields_ten() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_layer(&ramp(100, 4), dir.path(), 1).unwrap();
        assert_eq!(path.file_name().unwrap(), "Layer_1.layer");

        let file = LayerFile::open(&path).unwrap();
        assert_eq!(file.n_points(), 100);
        let names: Vec<_> = file.meta.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, COLUMNS);

        let scan = scan_layer(&path, "channel_1", 10).unwrap();
        assert_eq!(scan.len(), 10);
        assert_eq!(scan.rows().count(), 10);
    }

    #[test]
    fn column_mapping_follows_recording_layout() {
        let dir = tempfile::tempdir().unwrap();
        // 6 raw channels: x comes from channel 2, y from channel 3.
        let raw = RawSamples::new(6, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let path = write_layer(&raw, dir.path(), 3).unwrap();
        let file = LayerFile::open(&path).unwrap();
        assert_eq!(file.column("x").unwrap(), &[3.0, 9.0]);
        assert_eq!(file.column("y").unwrap(), &[4.0, 10.0]);
        assert_eq!(file.column("channel_1").unwrap(), &[1.0, 7.0]);
        assert_eq!(file.column("channel_4").unwrap(), &[4.0, 10.0]);

        let rows: Vec<_> = scan_layer(&path, "channel_2", 1).unwrap().rows().collect();
        assert_eq!(rows, vec![[3.0, 4.0, 2.0], [9.0, 10.0, 8.0]]);
    }

    #[test]
    fn stride_keeps_first_row_of_each_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_layer(&ramp(7, 4), dir.path(), 1).unwrap();
        let scan = scan_layer(&path, "channel_1", 3).unwrap();
        let values: Vec<f32> = scan.rows().map(|r| r[2]).collect();
        // channel_1 is raw column 0: 0, 4, 8, ... per row.
        assert_eq!(values, vec![0.0, 12.0, 24.0]);
        assert_eq!(scan.len(), 3);
        assert_eq!(scan_layer(&path, "channel_1", 0).unwrap().len(), 7);
    }

    #[test]
    fn too_few_channels_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_layer(&ramp(10, 3), dir.path(), 1).unwrap_err();
        assert!(matches!(err, LayerError::ChannelCount { found: 3 }));
    }

    #[test]
    fn missing_file_and_channel_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_layer(&dir.path().join("Layer_9.layer"), "channel_1", 1).err().unwrap();
        assert!(matches!(err, LayerError::NotFound(_)));

        let path = write_layer(&ramp(4, 4), dir.path(), 1).unwrap();
        let err = scan_layer(&path, "channel_9", 1).err().unwrap();
        assert!(matches!(err, LayerError::Schema { ref column, .. } if column == "channel_9"));
    }

    #[test]
    fn truncated_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_layer(&ramp(16, 4), dir.path(), 1).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();
        assert!(matches!(LayerFile::open(&path), Err(LayerError::Format { .. })));
    }

    /// Writes a layer by hand so the header can hold values `write_layer` never produces.
    fn write_raw_layer(path: &Path, meta: &LayerMeta, data: &[f32]) {
        let json = serde_json::to_vec(meta).unwrap();
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(&json);
        bytes.resize(bytes.len().next_multiple_of(HEADER_ALIGN), 0);
        bytes.extend(data.iter().flat_map(|v| v.to_le_bytes()));
        fs::write(path, bytes).unwrap();
    }

    fn single_column_meta(n_points: u64, offset: u64, len_bytes: u64) -> LayerMeta {
        LayerMeta {
            version: FORMAT_VERSION,
            n_points,
            columns: vec![ColumnMeta {
                name: "x".to_string(),
                offset,
                len_bytes,
            }],
            source: None,
            sample_rate: None,
        }
    }

    #[test]
    fn hand_written_header_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Layer_1.layer");
        write_raw_layer(&path, &single_column_meta(2, 4, 8), &[9.0, 1.0, 2.0]);
        let file = LayerFile::open(&path).unwrap();
        assert_eq!(file.column("x").unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn overflowing_column_offset_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Layer_1.layer");
        write_raw_layer(&path, &single_column_meta(1, u64::MAX - 3, 4), &[1.0]);
        assert!(matches!(LayerFile::open(&path), Err(LayerError::Format { .. })));

        write_raw_layer(&path, &single_column_meta(1, u64::MAX / 2, 4), &[1.0]);
        assert!(matches!(LayerFile::open(&path), Err(LayerError::Format { .. })));
    }

    #[test]
    fn overflowing_point_count_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Layer_1.layer");
        // n_points * 4 wraps to 0 in u64.
        write_raw_layer(&path, &single_column_meta(1 << 62, 0, 0), &[]);
        assert!(matches!(LayerFile::open(&path), Err(LayerError::Format { .. })));

        write_raw_layer(&path, &single_column_meta(u64::MAX / 4, 0, (u64::MAX / 4) * 4), &[1.0]);
        assert!(matches!(LayerFile::open(&path), Err(LayerError::Format { .. })));
    }

    #[test]
    fn empty_layer_scans_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_layer(&RawSamples::new(4, Vec::new()), dir.path(), 1).unwrap();
        let scan = scan_layer(&path, "channel_3", 5).unwrap();
        assert_eq!(scan.len(), 0);
        assert_eq!(scan.rows().count(), 0);
    }

    #[test]
    fn list_layers_uses_natural_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Layer_2.layer", "Layer_10.layer", "Layer_1.layer", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<_> = list_layers(dir.path())
            .iter()
            .map(|p| file_name(p))
            .collect();
        assert_eq!(names, vec!["Layer_1.layer", "Layer_2.layer", "Layer_10.layer"]);
    }

    #[test]
    fn list_layers_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_layers(&dir.path().join("nope")).is_empty());
        assert!(list_layers(dir.path()).is_empty());
    }

    #[test]
    fn natural_cmp_orders_numbers_by_value() {
        assert_eq!(natural_cmp("a2", "a10"), Ordering::Less);
        assert_eq!(natural_cmp("a10", "a9"), Ordering::Greater);
        assert_eq!(natural_cmp("a010", "a10"), Ordering::Greater);
        assert_eq!(natural_cmp("b1", "a2"), Ordering::Greater);
        assert_eq!(natural_cmp("abc", "abc"), Ordering::Equal);
        assert_eq!(natural_cmp("ab", "abc"), Ordering::Less);
    }

    #[test]
    fn wav_directory_converts_in_natural_order() {
        let wav_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let spec = hound::WavSpec {
            channels: 6,
            sample_rate: 1000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        for (name, base) in [("rec_10.wav", 100i16), ("rec_2.wav", 20i16)] {
            let mut w = hound::WavWriter::create(wav_dir.path().join(name), spec).unwrap();
            for row in 0..5i16 {
                for ch in 0..6i16 {
                    w.write_sample(base + row * 6 + ch).unwrap();
                }
            }
            w.finalize().unwrap();
        }

        let mut progress = Vec::new();
        let written = convert_wav_dir(wav_dir.path(), out_dir.path(), |done, total, _| {
            progress.push((done, total));
        })
        .unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(progress, vec![(1, 2), (2, 2)]);

        // rec_2 sorts first and becomes Layer_1; integer values are kept.
        let first = LayerFile::open(&out_dir.path().join("Layer_1.layer")).unwrap();
        assert_eq!(first.meta.sample_rate, Some(1000));
        assert_eq!(first.column("channel_1").unwrap()[0], 20.0);
        assert_eq!(first.column("x").unwrap()[0], 22.0);
        let second = LayerFile::open(&out_dir.path().join("Layer_2.layer")).unwrap();
        assert_eq!(second.column("channel_1").unwrap()[0], 100.0);
    }
}
