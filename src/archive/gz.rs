use crate::prelude::*;
use crate::archive::tar_machine::TarMachine;
use flate2::{Decompress, FlushDecompress, Status};

const OUTPUT_CHUNK: usize = 32 * 1024;

/// Drives `flate2`'s low-level incremental inflate (gzip framing via
/// `Decompress::new_gzip`) and feeds the decompressed bytes into the
/// shared tar state machine, one 32 KiB output buffer at a time.
pub struct GzTarStrategy {
    inflate: Decompress,
    tar: TarMachine,
    error: bool,
}

impl GzTarStrategy {
    pub fn new(tar: TarMachine) -> Self {
        GzTarStrategy {
            inflate: Decompress::new_gzip(true),
            tar,
            error: false,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error || self.tar.has_error()
    }

    pub fn is_at_end(&self) -> bool {
        self.tar.is_at_end()
    }

    pub fn extract_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        let mut out = vec![0u8; OUTPUT_CHUNK];
        loop {
            if self.error || self.tar.has_error() || self.tar.is_at_end() {
                return Ok(());
            }
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = self
                .inflate
                .decompress(data, &mut out, FlushDecompress::None)
                .context("inflating gzip stream")?;
            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;

            if produced > 0 {
                self.tar.extract_bytes(&out[..produced])?;
            }
            data = &data[consumed..];

            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::path_safety::DefaultPathFilter;
    use crate::archive::tar_machine::HEADER_BLOCK_SIZE;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::rc::Rc;
    use tempfile::tempdir;

    fn ustar_header(name: &str, size: u64) -> Vec<u8> {
        let mut block = vec![0u8; HEADER_BLOCK_SIZE];
        block[0..name.len()].copy_from_slice(name.as_bytes());
        let size_str = format!("{size:011o}\0");
        block[124..124 + size_str.len()].copy_from_slice(size_str.as_bytes());
        block[156] = b'0';
        block[257..262].copy_from_slice(b"ustar");
        block
    }

    fn padding_for(size: u64) -> usize {
        let rem = (size as usize) % HEADER_BLOCK_SIZE;
        if rem == 0 {
            0
        } else {
            HEADER_BLOCK_SIZE - rem
        }
    }

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, contents) in entries {
            out.extend(ustar_header(name, contents.len() as u64));
            out.extend_from_slice(contents);
            out.extend(vec![0u8; padding_for(contents.len() as u64)]);
        }
        out.extend(vec![0u8; HEADER_BLOCK_SIZE * 2]);
        out
    }

    #[test]
    fn extracts_files_from_a_gzip_compressed_tar() {
        let dir = tempdir().unwrap();
        let tar_bytes = build_tar(&[
            ("testDir/hello.c", b"int main(void) { return 0; }\n"),
            ("testDir/foo.txt", b"foo contents\n"),
        ]);

        let mut gz_bytes = Vec::new();
        {
            let mut encoder = GzEncoder::new(&mut gz_bytes, Compression::default());
            encoder.write_all(&tar_bytes).unwrap();
            encoder.finish().unwrap();
        }

        let tar = TarMachine::new(dir.path(), Rc::new(DefaultPathFilter));
        let mut strategy = GzTarStrategy::new(tar);
        strategy.extract_bytes(&gz_bytes).unwrap();
        strategy.flush().unwrap();

        assert!(!strategy.has_error());
        assert!(strategy.is_at_end());
        assert_eq!(
            std::fs::read(dir.path().join("testDir/hello.c")).unwrap(),
            b"int main(void) { return 0; }\n"
        );
        assert_eq!(
            std::fs::read(dir.path().join("testDir/foo.txt")).unwrap(),
            b"foo contents\n"
        );
    }
}
