//! Source image loading.
//!
//! Decoding runs on a worker thread. The frame loop polls the result once per
//! frame and never blocks on it.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Decoded RGBA8 image, rows top-down.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl SourceImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(EngineError::AssetLoadFailed(format!(
                "{width}x{height} image needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self { width, height, pixels })
    }

    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let pixels = rgba.repeat(width as usize * height as usize);
        Self { width, height, pixels }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)
            .map_err(|err| EngineError::AssetLoadFailed(err.to_string()))?
            .to_rgba8();
        Ok(Self::from(image))
    }

    pub fn open(path: &std::path::Path) -> Result<Self> {
        let image = image::open(path)
            .map_err(|err| EngineError::AssetLoadFailed(format!("{}: {err}", path.display())))?
            .to_rgba8();
        Ok(Self::from(image))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl From<image::RgbaImage> for SourceImage {
    fn from(image: image::RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: image.into_raw(),
        }
    }
}

/// Where the source image comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Decoded(SourceImage),
}

impl ImageSource {
    fn load(self) -> Result<SourceImage> {
        match self {
            ImageSource::Path(path) => SourceImage::open(&path),
            ImageSource::Bytes(bytes) => SourceImage::decode(&bytes),
            ImageSource::Decoded(image) => Ok(image),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AssetStatus {
    Pending,
    Ready(Arc<SourceImage>),
    Failed(String),
}

/// Delivers a load result from outside the engine.
pub struct AssetSender {
    tx: Sender<Result<SourceImage>>,
}

impl AssetSender {
    pub fn complete(self, image: SourceImage) {
        // The engine may already be gone; nothing to do then.
        let _ = self.tx.send(Ok(image));
    }

    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(EngineError::AssetLoadFailed(reason.into())));
    }
}

/// A load in flight. Once it resolves the outcome is kept; a failure is final.
pub struct PendingAsset {
    rx: Option<Receiver<Result<SourceImage>>>,
    status: AssetStatus,
}

impl PendingAsset {
    /// Decodes `source` on a background thread.
    pub fn spawn(source: ImageSource) -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(source.load());
        });
        Self::from_receiver(rx)
    }

    pub fn ready(image: SourceImage) -> Self {
        Self {
            rx: None,
            status: AssetStatus::Ready(Arc::new(image)),
        }
    }

    /// A load the caller resolves by hand through the returned sender.
    pub fn channel() -> (AssetSender, Self) {
        let (tx, rx) = mpsc::channel();
        (AssetSender { tx }, Self::from_receiver(rx))
    }

    fn from_receiver(rx: Receiver<Result<SourceImage>>) -> Self {
        Self {
            rx: Some(rx),
            status: AssetStatus::Pending,
        }
    }

    /// Non-blocking check for a result.
    pub fn poll(&mut self) -> AssetStatus {
        if let Some(rx) = &self.rx {
            match rx.try_recv() {
                Ok(Ok(image)) => {
                    self.status = AssetStatus::Ready(Arc::new(image));
                    self.rx = None;
                }
                Ok(Err(err)) => {
                    self.status = AssetStatus::Failed(err.to_string());
                    self.rx = None;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.status = AssetStatus::Failed("image loader went away".to_string());
                    self.rx = None;
                }
            }
        }
        self.status.clone()
    }
}
