//! Streaming download and decompression of repository data files.

use async_compression::tokio::bufread::{GzipDecoder, XzDecoder};
use futures::TryStreamExt;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use crate::{DecodeError, Error};

/// Limits bound the memory a single metadata read may consume.
/// Repositories whose decompressed metadata exceeds the cap are rejected
/// rather than buffered.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_decompressed_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            // primary.xml of a full BaseOS tree decompresses to tens of
            // megabytes; 512 MiB leaves generous headroom.
            max_decompressed_bytes: 512 << 20,
        }
    }
}

enum Encoding {
    Plain,
    Gzip,
    Xz,
}

impl Encoding {
    fn from_url(url: &str) -> Self {
        if url.ends_with(".gz") {
            Encoding::Gzip
        } else if url.ends_with(".xz") {
            Encoding::Xz
        } else {
            Encoding::Plain
        }
    }
}

/// Fetch `url`, decompress according to its suffix, and return the text.
/// The body is streamed through the decoder; at most `limits` bytes of
/// decompressed output are retained before the read is abandoned.
pub(crate) async fn fetch_text(
    client: &reqwest::Client,
    url: &str,
    limits: &Limits,
) -> Result<String, Error> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| Error::Fetch {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::FetchStatus {
            url: url.to_string(),
            status,
        });
    }

    let body = StreamReader::new(
        response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)),
    );

    let cap = limits.max_decompressed_bytes as u64;
    let mut decompressed = Vec::new();
    let read = match Encoding::from_url(url) {
        Encoding::Plain => body.take(cap + 1).read_to_end(&mut decompressed).await,
        Encoding::Gzip => {
            GzipDecoder::new(body)
                .take(cap + 1)
                .read_to_end(&mut decompressed)
                .await
        }
        Encoding::Xz => {
            XzDecoder::new(body)
                .take(cap + 1)
                .read_to_end(&mut decompressed)
                .await
        }
    };
    read.map_err(|source| Error::Decode {
        url: url.to_string(),
        source: DecodeError::Read(source),
    })?;

    if decompressed.len() as u64 > cap {
        return Err(Error::MetadataTooLarge {
            url: url.to_string(),
            limit: limits.max_decompressed_bytes,
        });
    }

    String::from_utf8(decompressed).map_err(|source| Error::Decode {
        url: url.to_string(),
        source: DecodeError::Utf8(source),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_follows_url_suffix() {
        assert!(matches!(
            Encoding::from_url("https://x/repodata/primary.xml.gz"),
            Encoding::Gzip,
        ));
        assert!(matches!(
            Encoding::from_url("https://x/repodata/modules.yaml.xz"),
            Encoding::Xz,
        ));
        assert!(matches!(
            Encoding::from_url("https://x/repodata/repomd.xml"),
            Encoding::Plain,
        ));
    }
}
