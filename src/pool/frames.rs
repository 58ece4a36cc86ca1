//! Pooled media buffers used by the built-in mixers and generators

use super::buffer_pool::Poolable;

/// Shape of a PCM block: interleaved channels, fixed frame capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmShape {
    pub channels: u16,
    pub capacity_frames: usize,
}

/// Interleaved f32 PCM with a fixed capacity
#[derive(Debug)]
pub struct PcmBlock {
    channels: u16,
    capacity_frames: usize,
    frames: usize,
    samples: Vec<f32>,
}

impl PcmBlock {
    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Valid frames
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Mark `frames` as valid and zero them; clamped to the capacity
    pub fn set_frames(&mut self, frames: usize) -> usize {
        self.frames = frames.min(self.capacity_frames);
        let len = self.frames * self.channels as usize;
        self.samples[..len].fill(0.0);
        self.frames
    }

    /// Valid interleaved samples
    pub fn samples(&self) -> &[f32] {
        &self.samples[..self.frames * self.channels as usize]
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        let len = self.frames * self.channels as usize;
        &mut self.samples[..len]
    }

    /// Interleaved samples of frame `index`
    pub fn frame(&self, index: usize) -> &[f32] {
        let ch = self.channels as usize;
        &self.samples[index * ch..(index + 1) * ch]
    }
}

impl Poolable for PcmBlock {
    type Shape = PcmShape;

    fn allocate(shape: &PcmShape) -> Self {
        PcmBlock {
            channels: shape.channels.max(1),
            capacity_frames: shape.capacity_frames,
            frames: 0,
            samples: vec![0.0; shape.capacity_frames * shape.channels.max(1) as usize],
        }
    }

    fn shape(&self) -> PcmShape {
        PcmShape {
            channels: self.channels,
            capacity_frames: self.capacity_frames,
        }
    }

    fn uninitialize(&mut self) {
        self.frames = 0;
    }
}

/// Canvas size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Straight-alpha RGBA8 image
#[derive(Debug)]
pub struct RgbaFrame {
    size: FrameSize,
    data: Vec<u8>,
}

impl RgbaFrame {
    pub fn size(&self) -> FrameSize {
        self.size
    }

    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn fill(&mut self, rgba: [u8; 4]) {
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.size.width as usize + x as usize) * 4;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = (y as usize * self.size.width as usize + x as usize) * 4;
        self.data[i..i + 4].copy_from_slice(&rgba);
    }
}

impl Poolable for RgbaFrame {
    type Shape = FrameSize;

    fn allocate(shape: &FrameSize) -> Self {
        RgbaFrame {
            size: *shape,
            data: vec![0; shape.pixels() * 4],
        }
    }

    fn shape(&self) -> FrameSize {
        self.size
    }
}
