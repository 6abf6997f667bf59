//! Streaming parser for `primary.xml`.
//!
//! The document can run to hundreds of thousands of `<package>` elements,
//! so it is consumed as an event stream and only the fields the matcher
//! needs are retained; no DOM is built.

use quick_xml::events::{BytesStart, Event};

use crate::DecodeError;

/// RpmPackage is one `<package>` record of a repository's primary
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpmPackage {
    pub name: String,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub checksum: String,
    pub checksum_type: String,
    /// `format/sourcerpm`, absent for source packages themselves.
    pub source_rpm: Option<String>,
}

impl RpmPackage {
    /// The package's NEVRA with explicit epoch, `name-e:v-r.arch`.
    pub fn nevra(&self) -> String {
        format!(
            "{}-{}:{}-{}.{}",
            self.name, self.epoch, self.version, self.release, self.arch
        )
    }
}

#[derive(Debug, Default)]
struct Builder {
    name: Option<String>,
    epoch: Option<String>,
    version: Option<String>,
    release: Option<String>,
    arch: Option<String>,
    checksum: Option<String>,
    checksum_type: Option<String>,
    source_rpm: Option<String>,
}

impl Builder {
    fn version_attrs(&mut self, element: &BytesStart) -> Result<(), DecodeError> {
        for attr in element.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let value = attr.unescape_value()?.into_owned();
            match attr.key.local_name().as_ref() {
                b"epoch" => self.epoch = Some(value),
                b"ver" => self.version = Some(value),
                b"rel" => self.release = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    fn checksum_attrs(&mut self, element: &BytesStart) -> Result<(), DecodeError> {
        for attr in element.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            if attr.key.local_name().as_ref() == b"type" {
                self.checksum_type = Some(attr.unescape_value()?.into_owned());
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<RpmPackage, DecodeError> {
        Ok(RpmPackage {
            name: self.name.ok_or(DecodeError::MissingField("name"))?,
            epoch: self.epoch.unwrap_or_else(|| "0".to_string()),
            version: self.version.ok_or(DecodeError::MissingField("version"))?,
            release: self.release.ok_or(DecodeError::MissingField("release"))?,
            arch: self.arch.ok_or(DecodeError::MissingField("arch"))?,
            checksum: self.checksum.ok_or(DecodeError::MissingField("checksum"))?,
            checksum_type: self
                .checksum_type
                .ok_or(DecodeError::MissingField("checksum type"))?,
            source_rpm: self.source_rpm.filter(|s| !s.is_empty()),
        })
    }
}

/// Which text content, if any, the cursor is currently inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    None,
    Name,
    Arch,
    Checksum,
    SourceRpm,
}

pub(crate) fn parse_primary(xml: &str) -> Result<Vec<RpmPackage>, DecodeError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut packages = Vec::new();
    let mut builder: Option<Builder> = None;
    let mut capture = Capture::None;

    loop {
        match reader.read_event()? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"package" => builder = Some(Builder::default()),
                b"name" if builder.is_some() => capture = Capture::Name,
                b"arch" if builder.is_some() => capture = Capture::Arch,
                b"checksum" => {
                    if let Some(builder) = builder.as_mut() {
                        builder.checksum_attrs(&element)?;
                        capture = Capture::Checksum;
                    }
                }
                b"version" => {
                    if let Some(builder) = builder.as_mut() {
                        builder.version_attrs(&element)?;
                    }
                }
                b"sourcerpm" if builder.is_some() => capture = Capture::SourceRpm,
                _ => {}
            },
            Event::Empty(element) => match element.local_name().as_ref() {
                b"version" => {
                    if let Some(builder) = builder.as_mut() {
                        builder.version_attrs(&element)?;
                    }
                }
                b"sourcerpm" => {}
                _ => {}
            },
            Event::Text(text) => {
                if let Some(builder) = builder.as_mut() {
                    let value = text.unescape()?;
                    match capture {
                        Capture::Name => builder.name = Some(value.into_owned()),
                        Capture::Arch => builder.arch = Some(value.into_owned()),
                        Capture::Checksum => builder.checksum = Some(value.into_owned()),
                        Capture::SourceRpm => builder.source_rpm = Some(value.into_owned()),
                        Capture::None => {}
                    }
                }
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"package" => {
                    if let Some(builder) = builder.take() {
                        packages.push(builder.finish()?);
                    }
                }
                b"name" | b"arch" | b"checksum" | b"sourcerpm" => capture = Capture::None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="2">
  <package type="rpm">
    <name>bash</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="5.1.8" rel="6.el9.1"/>
    <checksum type="sha256" pkgid="YES">4a7a7e1cbb7ba4c68f79e6fff0ef893b4446d5cf46a8a77519d76b6e18a4e50a</checksum>
    <summary>The GNU Bourne Again shell</summary>
    <format>
      <rpm:license>GPLv3+</rpm:license>
      <rpm:sourcerpm>bash-5.1.8-6.el9.1.src.rpm</rpm:sourcerpm>
      <rpm:provides>
        <rpm:entry name="bash" flags="EQ" epoch="0" ver="5.1.8" rel="6.el9.1"/>
      </rpm:provides>
    </format>
  </package>
  <package type="rpm">
    <name>redis</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="7.2.10" rel="1.module+el9.6.0+23332+115a3b01"/>
    <checksum type="sha256" pkgid="YES">b2f5e9d9ab7fd3b1702a6b8e8b355f9e9634e33c70bfbcf78fca736eaa4b2a88</checksum>
    <format>
      <rpm:sourcerpm>redis-7.2.10-1.module+el9.6.0+23332+115a3b01.src.rpm</rpm:sourcerpm>
    </format>
  </package>
</metadata>"#;

    #[test]
    fn parses_package_records() {
        let packages = parse_primary(PRIMARY).unwrap();
        assert_eq!(packages.len(), 2);

        let bash = &packages[0];
        assert_eq!(bash.name, "bash");
        assert_eq!(bash.epoch, "0");
        assert_eq!(bash.version, "5.1.8");
        assert_eq!(bash.release, "6.el9.1");
        assert_eq!(bash.arch, "x86_64");
        assert_eq!(bash.checksum_type, "sha256");
        assert_eq!(
            bash.source_rpm.as_deref(),
            Some("bash-5.1.8-6.el9.1.src.rpm"),
        );
        assert_eq!(bash.nevra(), "bash-0:5.1.8-6.el9.1.x86_64");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let broken = r#"<metadata><package type="rpm"><name>bash</name></package></metadata>"#;
        assert!(matches!(
            parse_primary(broken),
            Err(DecodeError::MissingField("version")),
        ));
    }

    #[test]
    fn source_package_has_no_sourcerpm() {
        let src = r#"<metadata>
  <package type="rpm">
    <name>bash</name>
    <arch>src</arch>
    <version epoch="0" ver="5.1.8" rel="6.el9.1"/>
    <checksum type="sha256">aabb</checksum>
    <format><rpm:sourcerpm></rpm:sourcerpm></format>
  </package>
</metadata>"#;
        let packages = parse_primary(src).unwrap();
        assert_eq!(packages[0].source_rpm, None);
    }
}
