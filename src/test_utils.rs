use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::block_cache::{BlockCache, BlockKey, LockedBlock};
use crate::codec::{
    Codec, CodecFailure, CodecFormat, CodecMessages, CodecResult, CodecSession, CodecStream,
    CodestreamInfo, ColorSpace, DecodedImage, ImageComponent,
};
use crate::errors::{Jp2Error, Result};
use crate::vsi::{create_mem_file, unlink_mem_file};

/// A struct that contains a temporary directory and a path to a file in that directory.
pub struct TempFixture {
    _temp_dir: tempfile::TempDir,
    temp_path: PathBuf,
}

impl TempFixture {
    /// Creates a temporary directory and path to a non-existent file with given `name`.
    pub fn empty(name: &str) -> Self {
        let _temp_dir = tempfile::tempdir().unwrap();
        let temp_path = _temp_dir.path().join(name);
        Self {
            _temp_dir,
            temp_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.temp_path
    }
}

impl AsRef<Path> for TempFixture {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

/// Returns the fully qualified path to `filename` in `${CARGO_MANIFEST_DIR}/fixtures`.
#[cfg(feature = "openjpeg")]
pub fn fixture(filename: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(filename)
}

/// A struct that represents a `/vsimem/` (in-memory) path.
///
/// The file will be deleted when the value is dropped.
pub struct InMemoryFixture {
    path: PathBuf,
}

impl InMemoryFixture {
    pub fn new(filename: &str, data: Vec<u8>) -> Self {
        let mut path = PathBuf::from("/vsimem");
        path.push(filename);
        create_mem_file(&path, data).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for InMemoryFixture {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

impl Drop for InMemoryFixture {
    fn drop(&mut self) {
        // some tests unlink the file themselves
        let _ = unlink_mem_file(&self.path);
    }
}

/// Default sample values: component `comp` at `(x, y)` of its plane.
pub fn pattern(comp: usize, x: usize, y: usize) -> i32 {
    ((x * 3 + y * 5 + comp * 40) % 251) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentSpec {
    pub precision: u8,
    pub signed: bool,
    pub dx: usize,
    pub dy: usize,
}

impl ComponentSpec {
    pub fn unsigned(precision: u8) -> Self {
        ComponentSpec {
            precision,
            signed: false,
            dx: 1,
            dy: 1,
        }
    }
}

/// Header of a codestream understood by [`SyntheticCodec`].
///
/// Layout: the SOC marker, then width, height, tile width, tile height,
/// component count, resolution count and color space as little endian
/// `u32`, then precision, signedness, dx and dy of each component as `u8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticImage {
    pub size: (usize, usize),
    pub tile_size: (usize, usize),
    pub num_resolutions: usize,
    pub color_space: ColorSpace,
    pub components: Vec<ComponentSpec>,
}

impl SyntheticImage {
    pub fn new(size: (usize, usize), tile_size: (usize, usize), bands: usize) -> Self {
        SyntheticImage {
            size,
            tile_size,
            num_resolutions: 6,
            color_space: ColorSpace::Unspecified,
            components: vec![ComponentSpec::unsigned(8); bands],
        }
    }

    /// A YCbCr image with chroma planes at half resolution.
    pub fn ycbcr420(size: (usize, usize), tile_size: (usize, usize)) -> Self {
        let chroma = ComponentSpec {
            dx: 2,
            dy: 2,
            ..ComponentSpec::unsigned(8)
        };
        SyntheticImage {
            color_space: ColorSpace::Sycc,
            components: vec![ComponentSpec::unsigned(8), chroma, chroma],
            ..Self::new(size, tile_size, 3)
        }
    }

    pub fn with_precisions(mut self, precisions: &[u8]) -> Self {
        self.components = precisions
            .iter()
            .map(|&precision| ComponentSpec::unsigned(precision))
            .collect();
        self
    }

    pub fn with_resolutions(mut self, num_resolutions: usize) -> Self {
        self.num_resolutions = num_resolutions;
        self
    }

    pub fn with_color_space(mut self, color_space: ColorSpace) -> Self {
        self.color_space = color_space;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0xff, 0x4f];
        for field in [
            self.size.0,
            self.size.1,
            self.tile_size.0,
            self.tile_size.1,
            self.components.len(),
            self.num_resolutions,
            color_space_code(self.color_space),
        ] {
            bytes.extend_from_slice(&(field as u32).to_le_bytes());
        }
        for c in &self.components {
            bytes.extend_from_slice(&[c.precision, c.signed as u8, c.dx as u8, c.dy as u8]);
        }
        bytes
    }

    pub fn to_mem(&self, filename: &str) -> InMemoryFixture {
        InMemoryFixture::new(filename, self.encode())
    }
}

fn color_space_code(color_space: ColorSpace) -> usize {
    match color_space {
        ColorSpace::Unknown => 0,
        ColorSpace::Unspecified => 1,
        ColorSpace::Srgb => 2,
        ColorSpace::Gray => 3,
        ColorSpace::Sycc => 4,
    }
}

fn color_space_from_code(code: usize) -> ColorSpace {
    match code {
        1 => ColorSpace::Unspecified,
        2 => ColorSpace::Srgb,
        3 => ColorSpace::Gray,
        4 => ColorSpace::Sycc,
        _ => ColorSpace::Unknown,
    }
}

/// Codec call that [`SyntheticCodec`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Header,
    Resolution,
    Area,
    Decode,
}

/// A decode performed by [`SyntheticCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeCall {
    Window {
        level: usize,
        area: (usize, usize, usize, usize),
    },
    Tile {
        level: usize,
        index: usize,
    },
}

type SampleFn = dyn Fn(usize, usize, usize) -> i32 + Send + Sync;

struct Shared {
    sample: Box<SampleFn>,
    fail: Mutex<Option<Phase>>,
    calls: Mutex<Vec<(DecodeCall, ThreadId)>>,
    sessions_ended: AtomicUsize,
}

impl Shared {
    fn check(&self, phase: Phase) -> CodecResult<()> {
        if *self.fail.lock() == Some(phase) {
            return Err(CodecFailure::new(format!("{:?} failed", phase)));
        }
        Ok(())
    }
}

/// In-process codec decoding [`SyntheticImage`] headers.
///
/// Sample values come from a function of the component and the position in
/// the component plane at the decoded resolution. Unsigned samples are
/// masked to their precision.
pub struct SyntheticCodec {
    shared: Arc<Shared>,
}

impl SyntheticCodec {
    pub fn new() -> Arc<Self> {
        Self::with_sample(pattern)
    }

    pub fn with_sample<F>(sample: F) -> Arc<Self>
    where
        F: Fn(usize, usize, usize) -> i32 + Send + Sync + 'static,
    {
        Arc::new(SyntheticCodec {
            shared: Arc::new(Shared {
                sample: Box::new(sample),
                fail: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
                sessions_ended: AtomicUsize::new(0),
            }),
        })
    }

    pub fn fail_at(&self, phase: Option<Phase>) {
        *self.shared.fail.lock() = phase;
    }

    pub fn decode_count(&self) -> usize {
        self.shared.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<DecodeCall> {
        self.shared.calls.lock().iter().map(|(call, _)| *call).collect()
    }

    pub fn decoding_threads(&self) -> HashSet<ThreadId> {
        self.shared.calls.lock().iter().map(|(_, id)| *id).collect()
    }

    pub fn sessions_ended(&self) -> usize {
        self.shared.sessions_ended.load(Ordering::SeqCst)
    }
}

impl Codec for SyntheticCodec {
    fn create_session(
        &self,
        _format: CodecFormat,
        _messages: CodecMessages,
    ) -> CodecResult<Box<dyn CodecSession>> {
        Ok(Box::new(SyntheticSession {
            shared: self.shared.clone(),
            header: None,
            level: 0,
            area: None,
        }))
    }
}

struct SyntheticSession {
    shared: Arc<Shared>,
    header: Option<SyntheticImage>,
    level: usize,
    area: Option<(usize, usize, usize, usize)>,
}

impl SyntheticSession {
    fn header(&self) -> CodecResult<&SyntheticImage> {
        self.header
            .as_ref()
            .ok_or_else(|| CodecFailure::new("header not read"))
    }

    /// Fill `image` with the planes covering `area` of the reference grid.
    fn render(
        &self,
        image: &mut DecodedImage,
        area: (usize, usize, usize, usize),
    ) -> CodecResult<()> {
        let header = self.header()?;
        let scale = 1 << self.level;
        let (x0, y0, x1, y1) = area;
        let (lx0, ly0) = (x0.div_ceil(scale), y0.div_ceil(scale));
        let (lx1, ly1) = (x1.div_ceil(scale), y1.div_ceil(scale));

        image.components = header
            .components
            .iter()
            .enumerate()
            .map(|(comp, spec)| {
                let (cx0, cy0) = (lx0.div_ceil(spec.dx), ly0.div_ceil(spec.dy));
                let width = lx1.div_ceil(spec.dx) - cx0;
                let height = ly1.div_ceil(spec.dy) - cy0;
                let mut data = Vec::with_capacity(width * height);
                for y in cy0..cy0 + height {
                    for x in cx0..cx0 + width {
                        let value = (self.shared.sample)(comp, x, y);
                        data.push(if spec.signed || spec.precision >= 31 {
                            value
                        } else {
                            value & ((1 << spec.precision) - 1)
                        });
                    }
                }
                ImageComponent {
                    dx: spec.dx,
                    dy: spec.dy,
                    width,
                    height,
                    precision: spec.precision,
                    signed: spec.signed,
                    data,
                }
            })
            .collect();
        Ok(())
    }

    fn record(&self, call: DecodeCall) {
        self.shared.calls.lock().push((call, thread::current().id()));
    }
}

impl CodecSession for SyntheticSession {
    fn setup(&mut self) -> CodecResult<()> {
        self.shared.check(Phase::Setup)
    }

    fn read_header(&mut self, stream: &mut CodecStream<'_>) -> CodecResult<DecodedImage> {
        self.shared.check(Phase::Header)?;
        let mut fixed = [0_u8; 30];
        if !stream.read_exact(&mut fixed) {
            return Err(CodecFailure::new("truncated header"));
        }
        if fixed[..2] != [0xff, 0x4f] {
            return Err(CodecFailure::new("missing SOC marker"));
        }
        let field = |i: usize| {
            u32::from_le_bytes(fixed[2 + 4 * i..6 + 4 * i].try_into().unwrap()) as usize
        };
        let mut components = vec![0_u8; 4 * field(4)];
        if !stream.read_exact(&mut components) {
            return Err(CodecFailure::new("truncated component list"));
        }
        let header = SyntheticImage {
            size: (field(0), field(1)),
            tile_size: (field(2), field(3)),
            num_resolutions: field(5),
            color_space: color_space_from_code(field(6)),
            components: components
                .chunks(4)
                .map(|c| ComponentSpec {
                    precision: c[0],
                    signed: c[1] != 0,
                    dx: c[2] as usize,
                    dy: c[3] as usize,
                })
                .collect(),
        };

        let (width, height) = header.size;
        let image = DecodedImage {
            x0: 0,
            y0: 0,
            x1: width,
            y1: height,
            color_space: header.color_space,
            components: header
                .components
                .iter()
                .map(|spec| ImageComponent {
                    dx: spec.dx,
                    dy: spec.dy,
                    width: width.div_ceil(spec.dx),
                    height: height.div_ceil(spec.dy),
                    precision: spec.precision,
                    signed: spec.signed,
                    data: Vec::new(),
                })
                .collect(),
        };
        self.header = Some(header);
        Ok(image)
    }

    fn codestream_info(&self) -> CodecResult<CodestreamInfo> {
        let header = self.header()?;
        Ok(CodestreamInfo {
            tile_x0: 0,
            tile_y0: 0,
            tile_width: header.tile_size.0,
            tile_height: header.tile_size.1,
            tiles_across: header.size.0.div_ceil(header.tile_size.0.max(1)),
            tiles_down: header.size.1.div_ceil(header.tile_size.1.max(1)),
            num_resolutions: header.num_resolutions,
            mct: false,
        })
    }

    fn set_decoded_resolution_factor(&mut self, level: usize) -> CodecResult<()> {
        self.shared.check(Phase::Resolution)?;
        if level >= self.header()?.num_resolutions {
            return Err(CodecFailure::new(format!("no resolution level {}", level)));
        }
        self.level = level;
        Ok(())
    }

    fn set_decode_area(
        &mut self,
        image: &mut DecodedImage,
        x0: usize,
        y0: usize,
        x1: usize,
        y1: usize,
    ) -> CodecResult<()> {
        self.shared.check(Phase::Area)?;
        let (width, height) = self.header()?.size;
        if x0 >= x1 || y0 >= y1 || x1 > width || y1 > height {
            return Err(CodecFailure::new("decode area outside of the image"));
        }
        self.area = Some((x0, y0, x1, y1));
        image.x0 = x0;
        image.y0 = y0;
        image.x1 = x1;
        image.y1 = y1;
        Ok(())
    }

    fn decode(
        &mut self,
        _stream: &mut CodecStream<'_>,
        image: &mut DecodedImage,
    ) -> CodecResult<()> {
        self.shared.check(Phase::Decode)?;
        let (width, height) = self.header()?.size;
        let area = self.area.unwrap_or((0, 0, width, height));
        self.render(image, area)?;
        self.record(DecodeCall::Window {
            level: self.level,
            area,
        });
        Ok(())
    }

    fn get_decoded_tile(
        &mut self,
        _stream: &mut CodecStream<'_>,
        image: &mut DecodedImage,
        tile_index: usize,
    ) -> CodecResult<()> {
        self.shared.check(Phase::Decode)?;
        let info = self.codestream_info()?;
        if tile_index >= info.tiles_across * info.tiles_down {
            return Err(CodecFailure::new(format!("no tile {}", tile_index)));
        }
        let (width, height) = self.header()?.size;
        let col = tile_index % info.tiles_across;
        let row = tile_index / info.tiles_across;
        let area = (
            col * info.tile_width,
            row * info.tile_height,
            ((col + 1) * info.tile_width).min(width),
            ((row + 1) * info.tile_height).min(height),
        );
        self.render(image, area)?;
        self.record(DecodeCall::Tile {
            level: self.level,
            index: tile_index,
        });
        Ok(())
    }

    fn end_decompress(&mut self, _stream: &mut CodecStream<'_>) -> CodecResult<()> {
        self.shared.sessions_ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Block cache failing the `fail_on`-th call to `lock_or_create`.
pub struct FailingCache<C> {
    inner: C,
    fail_on: usize,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl<C: BlockCache> FailingCache<C> {
    pub fn new(inner: C, fail_on: usize) -> Self {
        FailingCache {
            inner,
            fail_on,
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl<C: BlockCache> BlockCache for FailingCache<C> {
    fn try_lock(&self, key: BlockKey) -> Option<LockedBlock> {
        self.inner.try_lock(key)
    }

    fn try_lock_or_create(&self, key: BlockKey, size: usize) -> Result<Option<LockedBlock>> {
        self.inner.try_lock_or_create(key, size)
    }

    fn lock_or_create(&self, key: BlockKey, size: usize) -> Result<LockedBlock> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(Jp2Error::BlockAllocation { key, size });
        }
        self.inner.lock_or_create(key, size)
    }

    fn budget(&self) -> usize {
        self.inner.budget()
    }
}
