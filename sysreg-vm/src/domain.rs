//! libvirt domain description documents
//!
//! Only the handful of paths the run needs are understood: the domain name,
//! the backing disk, the console tty and the boot device. Everything else is
//! passed through byte for byte when the document is rewritten.

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::path::{Path, PathBuf};

use sysreg_core::error::{SysregError, SysregResult};

#[derive(Debug, Clone)]
pub struct DomainDescription {
    xml: String,
    name: Option<String>,
    disk_image: Option<PathBuf>,
    console_tty: Option<PathBuf>,
}

fn xml_error(e: impl std::fmt::Display) -> SysregError {
    SysregError::DomainDescription {
        message: e.to_string(),
    }
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, key: &str) -> SysregResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(xml_error)?;
        if attr.key.as_ref() == key.as_bytes() {
            return Ok(Some(attr.unescape_value().map_err(xml_error)?.into_owned()));
        }
    }
    Ok(None)
}

fn at(path: &[String], expected: &[&str]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(a, b)| a == b)
}

/// Copy of `boot` with its `dev` attribute set to `dev`
fn with_boot_device(boot: &BytesStart<'_>, dev: &str) -> SysregResult<BytesStart<'static>> {
    let mut rewritten = BytesStart::new(element_name(boot));
    for attr in boot.attributes() {
        let attr = attr.map_err(xml_error)?;
        if attr.key.as_ref() != b"dev" {
            rewritten.push_attribute(attr);
        }
    }
    rewritten.push_attribute(("dev", dev));
    Ok(rewritten)
}

impl DomainDescription {
    pub fn parse(xml: impl Into<String>) -> SysregResult<Self> {
        let xml = xml.into();
        let mut name = None;
        let mut disk_image = None;
        let mut console_tty = None;
        let mut saw_domain = false;

        {
            let mut reader = Reader::from_str(&xml);
            let mut path: Vec<String> = Vec::new();
            let mut in_disk = false;

            loop {
                let (element, is_start) = match reader.read_event().map_err(xml_error)? {
                    Event::Start(e) => (e, true),
                    Event::Empty(e) => (e, false),
                    Event::End(_) => {
                        if path.pop().as_deref() == Some("disk") {
                            in_disk = false;
                        }
                        continue;
                    }
                    Event::Text(t) => {
                        if at(&path, &["domain", "name"]) && name.is_none() {
                            let text = t.unescape().map_err(xml_error)?;
                            name = Some(text.trim().to_string());
                        }
                        continue;
                    }
                    Event::Eof => break,
                    _ => continue,
                };

                let tag = element_name(&element);
                if path.is_empty() {
                    if tag != "domain" {
                        return Err(xml_error(format!(
                            "root element is <{}>, expected <domain>",
                            tag
                        )));
                    }
                    saw_domain = true;
                }

                if at(&path, &["domain", "devices"]) {
                    if tag == "disk" && is_start && disk_image.is_none() {
                        in_disk = attribute(&element, "device")?.as_deref() == Some("disk");
                    }
                    if tag == "console" && console_tty.is_none() {
                        console_tty = attribute(&element, "tty")?
                            .filter(|tty| !tty.is_empty())
                            .map(PathBuf::from);
                    }
                }
                if in_disk
                    && tag == "source"
                    && disk_image.is_none()
                    && at(&path, &["domain", "devices", "disk"])
                {
                    disk_image = attribute(&element, "file")?
                        .filter(|file| !file.is_empty())
                        .map(PathBuf::from);
                }

                if is_start {
                    path.push(tag);
                }
            }
        }

        if !saw_domain {
            return Err(xml_error("document has no <domain> element"));
        }

        Ok(Self {
            xml,
            name,
            disk_image,
            console_tty,
        })
    }

    /// Read and parse a description from disk
    pub async fn load(path: &Path) -> SysregResult<Self> {
        let xml = tokio::fs::read_to_string(path).await.map_err(|e| {
            xml_error(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(xml)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Backing file of the first `<disk device="disk">`
    pub fn disk_image(&self) -> Option<&Path> {
        self.disk_image.as_deref()
    }

    /// `tty` attribute of the console device, set by libvirt once running
    pub fn console_tty(&self) -> Option<&Path> {
        self.console_tty.as_deref()
    }

    pub fn as_str(&self) -> &str {
        &self.xml
    }

    /// Document with `/domain/os/boot/@dev` set to `dev`
    ///
    /// A missing `<boot>` element is inserted at the end of `<os>`.
    pub fn with_boot_device(&self, dev: &str) -> SysregResult<String> {
        let mut reader = Reader::from_str(&self.xml);
        let mut writer = Writer::new(Vec::with_capacity(self.xml.len() + 16));
        let mut path: Vec<String> = Vec::new();
        let mut rewritten = false;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Eof => break,
                Event::Start(e) => {
                    let tag = element_name(&e);
                    if !rewritten && tag == "boot" && at(&path, &["domain", "os"]) {
                        rewritten = true;
                        writer
                            .write_event(Event::Start(with_boot_device(&e, dev)?))
                            .map_err(xml_error)?;
                    } else {
                        writer.write_event(Event::Start(e)).map_err(xml_error)?;
                    }
                    path.push(tag);
                }
                Event::Empty(e) => {
                    if !rewritten && element_name(&e) == "boot" && at(&path, &["domain", "os"]) {
                        rewritten = true;
                        writer
                            .write_event(Event::Empty(with_boot_device(&e, dev)?))
                            .map_err(xml_error)?;
                    } else {
                        writer.write_event(Event::Empty(e)).map_err(xml_error)?;
                    }
                }
                Event::End(e) => {
                    if !rewritten && at(&path, &["domain", "os"]) {
                        rewritten = true;
                        let boot = BytesStart::new("boot").with_attributes([("dev", dev)]);
                        writer.write_event(Event::Empty(boot)).map_err(xml_error)?;
                    }
                    path.pop();
                    writer.write_event(Event::End(e)).map_err(xml_error)?;
                }
                other => writer.write_event(other).map_err(xml_error)?,
            }
        }

        if !rewritten {
            return Err(xml_error("domain description has no <os> element"));
        }

        String::from_utf8(writer.into_inner()).map_err(xml_error)
    }
}
