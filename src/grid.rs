//! Off-screen grids the solver reads from and renders into.
//!
//! Every grid is a 2D RGBA texture owned by a [`RenderBackend`]. The types here
//! only carry handles and shape; the texels live on the backend side. Grids are
//! released explicitly because releasing needs the backend that owns them.

use crate::backend::RenderBackend;
use crate::error::Result;

/// Opaque handle to a backend texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Preferred: signed, filterable half floats.
    Rgba16Float,
    /// Fallback when half floats cannot be rendered to or filtered.
    /// Values are clamped to [0, 1] on write.
    Rgba8Unorm,
}

impl TextureFormat {
    pub fn select(half_float_renderable_and_filterable: bool) -> Self {
        if half_float_renderable_and_filterable {
            TextureFormat::Rgba16Float
        } else {
            TextureFormat::Rgba8Unorm
        }
    }

    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba8Unorm => 4,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, TextureFormat::Rgba16Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Linear,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridDescriptor {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub filter: FilterMode,
}

impl GridDescriptor {
    pub fn square(label: &'static str, size: u32, format: TextureFormat, filter: FilterMode) -> Self {
        Self {
            label,
            width: size,
            height: size,
            format,
            filter,
        }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// One allocated grid texture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridBuffer {
    id: TextureId,
    desc: GridDescriptor,
}

impl GridBuffer {
    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn descriptor(&self) -> &GridDescriptor {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn texel_size(&self) -> [f32; 2] {
        [1.0 / self.desc.width as f32, 1.0 / self.desc.height as f32]
    }
}

/// Allocates one zero-filled grid on `backend`.
pub fn allocate<B: RenderBackend + ?Sized>(backend: &mut B, desc: GridDescriptor) -> Result<GridBuffer> {
    let id = backend.allocate(&desc)?;
    Ok(GridBuffer { id, desc })
}

/// Records every grid it hands out so a half-built set can be rolled back
/// when a later allocation fails.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    ids: Vec<TextureId>,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grid<B: RenderBackend + ?Sized>(&mut self, backend: &mut B, desc: GridDescriptor) -> Result<GridBuffer> {
        let buffer = allocate(backend, desc)?;
        self.ids.push(buffer.id);
        Ok(buffer)
    }

    pub fn double<B: RenderBackend + ?Sized>(&mut self, backend: &mut B, desc: GridDescriptor) -> Result<DoubleBuffer> {
        let first = self.grid(backend, desc)?;
        let second = self.grid(backend, desc)?;
        Ok(DoubleBuffer {
            slots: [first, second],
            read: 0,
        })
    }

    pub fn single<B: RenderBackend + ?Sized>(&mut self, backend: &mut B, desc: GridDescriptor) -> Result<SingleBuffer> {
        Ok(SingleBuffer {
            buffer: self.grid(backend, desc)?,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Releases everything recorded so far.
    pub fn rollback<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        for id in self.ids {
            backend.release(id);
        }
    }
}

/// A read/write pair. A pass reads `read()`, renders into `write()`, then the
/// caller swaps. The two slots never alias.
#[derive(Debug)]
pub struct DoubleBuffer {
    slots: [GridBuffer; 2],
    read: usize,
}

impl DoubleBuffer {
    pub fn allocate<B: RenderBackend + ?Sized>(backend: &mut B, desc: GridDescriptor) -> Result<Self> {
        let mut ledger = AllocationLedger::new();
        ledger.double(backend, desc).map_err(|err| {
            ledger.rollback(backend);
            err
        })
    }

    pub fn read(&self) -> &GridBuffer {
        &self.slots[self.read]
    }

    pub fn write(&self) -> &GridBuffer {
        &self.slots[self.read ^ 1]
    }

    pub fn swap(&mut self) {
        self.read ^= 1;
    }

    pub fn descriptor(&self) -> &GridDescriptor {
        self.slots[0].descriptor()
    }

    pub fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        for slot in self.slots {
            backend.release(slot.id);
        }
    }
}

/// A grid rebuilt from scratch every frame (divergence, curl).
#[derive(Debug)]
pub struct SingleBuffer {
    buffer: GridBuffer,
}

impl SingleBuffer {
    pub fn allocate<B: RenderBackend + ?Sized>(backend: &mut B, desc: GridDescriptor) -> Result<Self> {
        Ok(Self {
            buffer: allocate(backend, desc)?,
        })
    }

    pub fn get(&self) -> &GridBuffer {
        &self.buffer
    }

    pub fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        backend.release(self.buffer.id);
    }
}
