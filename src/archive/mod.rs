pub mod gz;
pub mod path_safety;
pub mod tar_machine;
pub mod xz;
pub mod zip;

use crate::prelude::*;
use self::gz::GzTarStrategy;
use self::path_safety::{DefaultPathFilter, PathFilter};
use self::tar_machine::TarMachine;
use self::xz::XzTarStrategy;
use self::zip::ZipStrategy;
use flate2::{Decompress, FlushDecompress, Status as InflateStatus};
use std::path::PathBuf;
use std::rc::Rc;

const TAR_MAGIC_OFFSET: usize = 257;
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, PartialEq, Eq)]
enum Detection {
    Zip,
    Xz,
    Gz,
    Tar,
    InsufficientData,
    Invalid,
}

enum State {
    Detecting,
    Tar(TarMachine),
    Gz(Box<GzTarStrategy>),
    Xz(Box<XzTarStrategy>),
    Zip(ZipStrategy),
    Invalid,
}

/// Streaming, format-auto-detecting archive decoder: tar, gzip-tar,
/// xz-tar, or zip, chosen from the first bytes of the stream. Every
/// entry path is run through the installed [`PathFilter`] before any
/// disk mutation, so extraction can never escape `root`.
pub struct ArchiveExtractor {
    root: PathBuf,
    filter: Rc<dyn PathFilter>,
    prebuffer: Vec<u8>,
    state: State,
}

impl ArchiveExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_filter(root, Rc::new(DefaultPathFilter))
    }

    pub fn with_filter(root: impl Into<PathBuf>, filter: Rc<dyn PathFilter>) -> Self {
        ArchiveExtractor {
            root: root.into(),
            filter,
            prebuffer: Vec::new(),
            state: State::Detecting,
        }
    }

    pub fn has_error(&self) -> bool {
        match &self.state {
            State::Detecting => false,
            State::Tar(m) => m.has_error(),
            State::Gz(s) => s.has_error(),
            State::Xz(s) => s.has_error(),
            State::Zip(s) => s.has_error(),
            State::Invalid => true,
        }
    }

    pub fn is_at_end_of_archive(&self) -> bool {
        match &self.state {
            State::Detecting => false,
            State::Tar(m) => m.is_at_end(),
            State::Gz(s) => s.is_at_end(),
            State::Xz(s) => s.is_at_end(),
            State::Zip(s) => s.is_at_end(),
            State::Invalid => false,
        }
    }

    /// Appends bytes; may be called repeatedly with chunks of any size.
    pub fn extract_bytes(&mut self, data: &[u8]) -> Result<()> {
        if let State::Detecting = self.state {
            self.prebuffer.extend_from_slice(data);
            match detect_format(&self.prebuffer) {
                Detection::InsufficientData => return Ok(()),
                Detection::Invalid => {
                    self.state = State::Invalid;
                    return Ok(());
                }
                Detection::Tar => {
                    self.state = State::Tar(TarMachine::new(self.root.clone(), self.filter.clone()));
                }
                Detection::Gz => {
                    let tar = TarMachine::new(self.root.clone(), self.filter.clone());
                    self.state = State::Gz(Box::new(GzTarStrategy::new(tar)));
                }
                Detection::Xz => {
                    let tar = TarMachine::new(self.root.clone(), self.filter.clone());
                    self.state = State::Xz(Box::new(XzTarStrategy::new(tar)?));
                }
                Detection::Zip => {
                    self.state = State::Zip(ZipStrategy::new(self.root.clone(), self.filter.clone()));
                }
            }
            let buffered = std::mem::take(&mut self.prebuffer);
            return self.feed(&buffered);
        }
        self.feed(data)
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.state {
            State::Detecting => unreachable!(),
            State::Tar(m) => m.extract_bytes(data),
            State::Gz(s) => s.extract_bytes(data),
            State::Xz(s) => s.extract_bytes(data),
            State::Zip(s) => s.extract_bytes(data),
            State::Invalid => Ok(()),
        }
    }

    /// Signals end of input. Required for zip (whose central directory
    /// can only be read once the whole archive is buffered) and xz
    /// (whose LZMA stream needs a final `FINISH` action).
    pub fn flush(&mut self) -> Result<()> {
        match &mut self.state {
            State::Detecting => {
                if detect_format(&self.prebuffer) == Detection::InsufficientData {
                    bail!("archive ended before enough bytes arrived to detect its format");
                }
                Ok(())
            }
            State::Tar(_) => Ok(()),
            State::Gz(s) => s.flush(),
            State::Xz(s) => s.flush(),
            State::Zip(s) => s.flush(),
            State::Invalid => Ok(()),
        }
    }
}

fn detect_format(prebuffer: &[u8]) -> Detection {
    if prebuffer.len() >= ZIP_MAGIC.len() && prebuffer[..ZIP_MAGIC.len()] == ZIP_MAGIC {
        return Detection::Zip;
    }
    if prebuffer.len() >= XZ_MAGIC.len() && prebuffer[..XZ_MAGIC.len()] == XZ_MAGIC {
        return Detection::Xz;
    }
    if prebuffer.len() >= GZIP_MAGIC.len() && prebuffer[..GZIP_MAGIC.len()] == GZIP_MAGIC {
        return match probe_gzip_contains_ustar(prebuffer) {
            Some(true) => Detection::Gz,
            Some(false) => Detection::Invalid,
            None => Detection::InsufficientData,
        };
    }
    if prebuffer.len() >= tar_machine::HEADER_BLOCK_SIZE {
        let magic_end = TAR_MAGIC_OFFSET + 5;
        return if &prebuffer[TAR_MAGIC_OFFSET..magic_end] == b"ustar" {
            Detection::Tar
        } else {
            Detection::Invalid
        };
    }
    Detection::InsufficientData
}

/// Trial-inflates `prebuffer` (without consuming the real decoder state)
/// to decide whether this gzip stream's first decoded block looks like
/// a ustar tar header. Returns `None` if not enough bytes have arrived
/// yet to produce 512 decoded bytes (or reach end of stream).
fn probe_gzip_contains_ustar(prebuffer: &[u8]) -> Option<bool> {
    let mut probe = Decompress::new_gzip(true);
    let mut out = vec![0u8; tar_machine::HEADER_BLOCK_SIZE];
    let status = probe
        .decompress(prebuffer, &mut out, FlushDecompress::None)
        .ok()?;
    let produced = probe.total_out() as usize;
    if produced < tar_machine::HEADER_BLOCK_SIZE && status != InflateStatus::StreamEnd {
        return None;
    }
    let magic_end = TAR_MAGIC_OFFSET + 5;
    if produced < magic_end {
        return Some(false);
    }
    Some(&out[TAR_MAGIC_OFFSET..magic_end] == b"ustar")
}
