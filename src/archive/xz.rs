use crate::prelude::*;
use crate::archive::tar_machine::TarMachine;
use xz2::stream::{Action, Status, Stream};

const OUTPUT_CHUNK: usize = 32 * 1024;

/// Drives `xz2`'s incremental LZMA stream decoder (unlimited memlimit,
/// matching the source's `UINT64_MAX`) and feeds decompressed bytes into
/// the shared tar state machine.
pub struct XzTarStrategy {
    stream: Stream,
    tar: TarMachine,
    error: bool,
    finished: bool,
}

impl XzTarStrategy {
    pub fn new(tar: TarMachine) -> Result<Self> {
        let stream = Stream::new_stream_decoder(u64::MAX, 0).context("initializing xz decoder")?;
        Ok(XzTarStrategy {
            stream,
            tar,
            error: false,
            finished: false,
        })
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
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();
            let status = self
                .stream
                .process(data, &mut out, Action::Run)
                .context("decoding xz stream")?;
            let consumed = (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;

            if produced > 0 {
                self.tar.extract_bytes(&out[..produced])?;
            }
            data = &data[consumed..];

            if status == Status::StreamEnd {
                self.finished = true;
                return Ok(());
            }
            if consumed == 0 && produced == 0 {
                return Ok(());
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let mut out = vec![0u8; OUTPUT_CHUNK];
        loop {
            let before_out = self.stream.total_out();
            let status = self
                .stream
                .process(&[], &mut out, Action::Finish)
                .context("finishing xz stream")?;
            let produced = (self.stream.total_out() - before_out) as usize;
            if produced > 0 {
                self.tar.extract_bytes(&out[..produced])?;
            }
            if status == Status::StreamEnd {
                self.finished = true;
                return Ok(());
            }
            if produced == 0 {
                self.error = true;
                bail!("xz stream did not reach LZMA_STREAM_END on flush");
            }
        }
    }
}
