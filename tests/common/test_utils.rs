#![allow(dead_code)]

use std::collections::VecDeque;

use packed_scene::{
    CameraFrame, GeometryData, Viewport,
    cgmath::Point3,
    context::{BufferHandle, BufferKind, DrawCall, Framebuffer, GpuBackend},
    pipelines::DrawPass,
};
use rustc_hash::FxHashMap;

/// Headless backend that keeps a log of everything the core asks of the GPU.
///
/// `read_pixel` answers from `pixels` in order and falls back to the cleared
/// background once the script runs out.
#[derive(Default)]
pub struct RecordingBackend {
    next_handle: u64,
    live: FxHashMap<BufferHandle, (BufferKind, usize)>,
    pub allocations: Vec<(BufferHandle, BufferKind, usize)>,
    pub updates: Vec<(BufferHandle, u64, usize)>,
    pub frees: Vec<BufferHandle>,
    pub double_frees: Vec<BufferHandle>,
    pub begins: Vec<Framebuffer>,
    pub draws: Vec<DrawCall>,
    pub reads: Vec<(Framebuffer, [u32; 2])>,
    pub pixels: VecDeque<[u8; 4]>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pixels(pixels: impl IntoIterator<Item = [u8; 4]>) -> Self {
        Self {
            pixels: pixels.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.live.len()
    }

    pub fn allocations_of(&self, kind: BufferKind) -> usize {
        self.allocations.iter().filter(|(_, k, _)| *k == kind).count()
    }

    pub fn draws_for(&self, pass: DrawPass) -> Vec<&DrawCall> {
        self.draws.iter().filter(|d| d.pass == pass).collect()
    }

    pub fn clear_log(&mut self) {
        self.allocations.clear();
        self.updates.clear();
        self.frees.clear();
        self.begins.clear();
        self.draws.clear();
        self.reads.clear();
    }
}

impl GpuBackend for RecordingBackend {
    fn allocate_buffer(&mut self, kind: BufferKind, data: &[u8]) -> anyhow::Result<BufferHandle> {
        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        self.live.insert(handle, (kind, data.len()));
        self.allocations.push((handle, kind, data.len()));
        Ok(handle)
    }

    fn update_buffer_range(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let Some((_, size)) = self.live.get(&handle) else {
            anyhow::bail!("update of unknown buffer {handle:?}");
        };
        anyhow::ensure!(
            offset as usize + data.len() <= *size,
            "update overflows buffer {handle:?}"
        );
        self.updates.push((handle, offset, data.len()));
        Ok(())
    }

    fn free_buffer(&mut self, handle: BufferHandle) {
        if self.live.remove(&handle).is_none() {
            self.double_frees.push(handle);
        }
        self.frees.push(handle);
    }

    fn begin(&mut self, target: Framebuffer, _viewport: Viewport) -> anyhow::Result<()> {
        self.begins.push(target);
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> anyhow::Result<()> {
        self.draws.push(call.clone());
        Ok(())
    }

    fn read_pixel(&mut self, target: Framebuffer, pos: [u32; 2]) -> anyhow::Result<[u8; 4]> {
        self.reads.push((target, pos));
        Ok(self.pixels.pop_front().unwrap_or([0; 4]))
    }
}

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Triangle in the z = 0 plane around the origin, facing +z.
pub fn triangle() -> GeometryData {
    GeometryData::triangles(
        vec![-1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 0.0, 1.0, 0.0],
        vec![0, 1, 2],
    )
}

/// Closed unit cube with shared corners and outward winding.
pub fn cube() -> GeometryData {
    #[rustfmt::skip]
    let positions = vec![
        0.0, 0.0, 0.0,  1.0, 0.0, 0.0,  1.0, 1.0, 0.0,  0.0, 1.0, 0.0,
        0.0, 0.0, 1.0,  1.0, 0.0, 1.0,  1.0, 1.0, 1.0,  0.0, 1.0, 1.0,
    ];
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1,  0, 3, 2, // back
        4, 5, 6,  4, 6, 7, // front
        0, 1, 5,  0, 5, 4, // bottom
        3, 7, 6,  3, 6, 2, // top
        0, 4, 7,  0, 7, 3, // left
        1, 2, 6,  1, 6, 5, // right
    ];
    GeometryData::triangles(positions, indices)
}

/// 100x100 perspective camera on the +z axis looking at the origin.
pub fn front_camera() -> CameraFrame {
    CameraFrame::look_at(
        Point3::new(0.0, 0.0, 10.0),
        Point3::new(0.0, 0.0, 0.0),
        45.0,
        0.1,
        100.0,
        Viewport::new(100, 100),
    )
}

/// Small deterministic generator for reproducible state sequences.
pub struct Lcg(pub u64);

impl Lcg {
    pub fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}
