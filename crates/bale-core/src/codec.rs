use bale_schema::Codec;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// zstd level used for `tar.zst` parts; favours ratio over speed.
pub const ZSTD_LEVEL: i32 = 19;

/// Pass-through writer that counts bytes written.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compress everything from `reader` into `writer`; returns compressed bytes written.
pub fn compress<R: Read + ?Sized, W: Write>(
    codec: Codec,
    reader: &mut R,
    writer: W,
) -> io::Result<u64> {
    let mut counting = CountingWriter::new(writer);
    match codec {
        Codec::Gzip => {
            let mut enc = GzEncoder::new(&mut counting, Compression::best());
            io::copy(reader, &mut enc)?;
            enc.finish()?;
        }
        Codec::Zstd => {
            let mut enc = zstd::Encoder::new(&mut counting, ZSTD_LEVEL)?;
            io::copy(reader, &mut enc)?;
            enc.finish()?;
        }
        Codec::None => {
            io::copy(reader, &mut counting)?;
        }
    }
    counting.flush()?;
    Ok(counting.count())
}

/// Wrap `reader` so it yields the uncompressed stream.
pub fn decoder<'a, R: Read + 'a>(codec: Codec, reader: R) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match codec {
        Codec::Gzip => Box::new(GzDecoder::new(reader)),
        Codec::Zstd => Box::new(zstd::Decoder::new(reader)?),
        Codec::None => Box::new(reader),
    })
}
