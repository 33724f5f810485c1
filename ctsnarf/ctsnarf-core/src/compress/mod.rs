//! Compression writer/reader factories for chunk output.

use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// Supported chunk compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algo {
    None,
    Gzip,
    Bzip2,
    Zstd,
}

impl Algo {
    /// Parse a job option value; the empty string means no compression.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "" | "none" => Ok(Algo::None),
            "gzip" => Ok(Algo::Gzip),
            "bzip2" => Ok(Algo::Bzip2),
            "zstd" => Ok(Algo::Zstd),
            other => Err(Error::validation(format!(
                "unknown compression algorithm {other:?}"
            ))),
        }
    }

    /// HTTP `Content-Encoding` value, if the algorithm has one.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Algo::None => None,
            Algo::Gzip => Some("gzip"),
            Algo::Bzip2 => Some("x-bzip2"),
            Algo::Zstd => Some("zstd"),
        }
    }

    /// Conventional filename suffix ("" for none).
    pub fn suffix(&self) -> &'static str {
        match self {
            Algo::None => "",
            Algo::Gzip => ".gz",
            Algo::Bzip2 => ".bz2",
            Algo::Zstd => ".zst",
        }
    }
}

/// A compressing writer that must be finished to flush its trailer.
pub trait CompressWrite: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Wrap `w` in a compressor for `algo`. gzip uses the default level,
/// bzip2 best compression, zstd the library default. `None` is a
/// transparent passthrough whose finish only flushes.
pub fn writer<W: Write + Send + 'static>(w: W, algo: Algo) -> Result<Box<dyn CompressWrite>> {
    Ok(match algo {
        Algo::None => Box::new(Plain(w)),
        Algo::Gzip => Box::new(Gzip(flate2::write::GzEncoder::new(
            w,
            flate2::Compression::default(),
        ))),
        Algo::Bzip2 => Box::new(Bzip2(bzip2::write::BzEncoder::new(
            w,
            bzip2::Compression::best(),
        ))),
        Algo::Zstd => Box::new(Zstd(zstd::stream::write::Encoder::new(w, 0).map_err(
            |e| Error::fatal(format!("zstd encoder: {e}")),
        )?)),
    })
}

/// Wrap `r` in a decompressor for `algo`.
pub fn reader<R: Read + Send + 'static>(r: R, algo: Algo) -> Result<Box<dyn Read + Send>> {
    Ok(match algo {
        Algo::None => Box::new(r),
        Algo::Gzip => Box::new(flate2::read::GzDecoder::new(r)),
        Algo::Bzip2 => Box::new(bzip2::read::BzDecoder::new(r)),
        Algo::Zstd => Box::new(
            zstd::stream::read::Decoder::new(r)
                .map_err(|e| Error::fatal(format!("zstd decoder: {e}")))?,
        ),
    })
}

struct Plain<W: Write>(W);

impl<W: Write> Write for Plain<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> CompressWrite for Plain<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

struct Gzip<W: Write>(flate2::write::GzEncoder<W>);

impl<W: Write> Write for Gzip<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> CompressWrite for Gzip<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(|_| ())
    }
}

struct Bzip2<W: Write>(bzip2::write::BzEncoder<W>);

impl<W: Write> Write for Bzip2<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> CompressWrite for Bzip2<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(|_| ())
    }
}

struct Zstd<W: Write>(zstd::stream::write::Encoder<'static, W>);

impl<W: Write> Write for Zstd<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> CompressWrite for Zstd<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(|_| ())
    }
}
