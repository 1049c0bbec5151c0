use std::str::FromStr;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_tar::{Builder, EntryType, Header};
use tracing::instrument;

use casfs_castore::{CasReader, Error, NodeKind, Sink, SriDigest, Stat, Tree};

pub type ArchiveWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Output archive format. Only PAX preserves full metadata; GNU and
/// USTAR drop xattrs and reject oversized fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TarFormat {
    #[default]
    Pax,
    Gnu,
    Ustar,
}

impl FromStr for TarFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pax" => Ok(TarFormat::Pax),
            "gnu" => Ok(TarFormat::Gnu),
            "ustar" => Ok(TarFormat::Ustar),
            _ => Err(()),
        }
    }
}

/// Writes a traversed tree as a tar archive, lifting headers from the
/// rich per-node metadata and streaming bodies from the CAS.
pub struct TarSink {
    builder: Option<Builder<ArchiveWriter>>,
    format: TarFormat,
    /// Prepended to every entry name; when empty, the root directory
    /// record is skipped entirely.
    root: String,
    xattr_pax_prefix: String,
}

impl TarSink {
    pub(super) fn new(
        writer: ArchiveWriter,
        format: TarFormat,
        root: String,
        xattr_pax_prefix: String,
    ) -> Self {
        Self {
            builder: Some(Builder::new(writer)),
            format,
            root,
            xattr_pax_prefix,
        }
    }

    async fn append_node(
        &self,
        builder: &mut Builder<ArchiveWriter>,
        cas: &dyn CasReader,
        stat: &Stat,
    ) -> Result<(), Error> {
        let name = self.entry_name(&stat.name, stat.kind == NodeKind::Directory);
        let mut pax_records: Vec<(String, Vec<u8>)> = Vec::new();

        let mut header = match self.format {
            TarFormat::Gnu => Header::new_gnu(),
            TarFormat::Pax | TarFormat::Ustar => Header::new_ustar(),
        };
        header.set_entry_type(match stat.kind {
            NodeKind::Directory => EntryType::dir(),
            NodeKind::Symlink => EntryType::symlink(),
            _ => EntryType::file(),
        });
        header.set_mode(parse_mode(&stat.attributes.mode)?);
        header.set_uid(parse_id(&stat.attributes.user_id)?);
        header.set_gid(parse_id(&stat.attributes.group_id)?);
        let mtime = stat.attributes.mtime.timestamp().max(0) as u64;
        header.set_mtime(mtime);

        self.set_or_record(
            &mut header,
            &mut pax_records,
            "uname",
            &stat.attributes.user_name,
            Header::set_username,
        )?;
        self.set_or_record(
            &mut header,
            &mut pax_records,
            "gname",
            &stat.attributes.group_name,
            Header::set_groupname,
        )?;

        if stat.kind == NodeKind::Symlink {
            if header.set_link_name(&stat.payload).is_err() {
                if self.format != TarFormat::Pax {
                    return Err(too_large("link target", &stat.payload));
                }
                pax_records.push(("linkpath".to_string(), stat.payload.clone().into_bytes()));
            }
        }

        if header.set_path(&name).is_err() {
            if self.format != TarFormat::Pax {
                return Err(too_large("entry name", &name));
            }
            pax_records.push(("path".to_string(), name.clone().into_bytes()));
            header
                .set_path(truncate_name(&name))
                .map_err(Error::Io)?;
        }

        if self.format == TarFormat::Pax {
            for (attr, value) in &stat.attributes.xattrs {
                pax_records.push((
                    format!("{}{}", self.xattr_pax_prefix, attr),
                    value.clone(),
                ));
            }
        }

        if !pax_records.is_empty() {
            let data = encode_pax_records(&pax_records);
            let mut extension = Header::new_ustar();
            extension.set_entry_type(EntryType::XHeader);
            extension
                .set_path(pax_header_name(&name))
                .map_err(Error::Io)?;
            extension.set_mode(0o644);
            extension.set_mtime(mtime);
            extension.set_size(data.len() as u64);
            extension.set_cksum();
            let mut data_reader: &[u8] = &data;
            builder.append(&extension, &mut data_reader).await?;
        }

        match stat.kind {
            NodeKind::Regular => {
                header.set_size(stat.size);
                header.set_cksum();
                let digest: SriDigest = stat.payload.parse()?;
                let mut body = cas.open(&digest).await?;
                builder.append(&header, &mut body).await?;
            }
            _ => {
                header.set_size(0);
                header.set_cksum();
                builder.append(&header, &mut tokio::io::empty()).await?;
            }
        }
        Ok(())
    }

    /// Sets a bounded header string field, falling back to a PAX record
    /// for oversized values when the format allows it.
    fn set_or_record(
        &self,
        header: &mut Header,
        pax_records: &mut Vec<(String, Vec<u8>)>,
        record_key: &str,
        value: &str,
        set: fn(&mut Header, &str) -> std::io::Result<()>,
    ) -> Result<(), Error> {
        if value.is_empty() || set(header, value).is_ok() {
            return Ok(());
        }
        if self.format != TarFormat::Pax {
            return Err(too_large(record_key, value));
        }
        pax_records.push((record_key.to_string(), value.as_bytes().to_vec()));
        Ok(())
    }

    fn entry_name(&self, name: &str, is_directory: bool) -> String {
        let relative = name.trim_start_matches('/');
        let mut out = if self.root.is_empty() {
            relative.to_string()
        } else if relative.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{}", self.root.trim_end_matches('/'), relative)
        };
        if let Some(stripped) = out.strip_prefix("./") {
            out = stripped.to_string();
        }
        if out.is_empty() {
            out = ".".to_string();
        }
        if is_directory && !out.ends_with('/') {
            out.push('/');
        }
        out
    }
}

#[async_trait]
impl Sink for TarSink {
    #[instrument(skip_all)]
    async fn consume(&mut self, tree: &Tree, cas: &dyn CasReader) -> Result<(), Error> {
        let mut builder = self.builder.take().ok_or(Error::AlreadyRunning)?;

        for node in &tree.nodes {
            let stat = &node.stat;
            if stat.name == "/" && self.root.is_empty() {
                continue;
            }
            if stat.kind == NodeKind::Other {
                tracing::debug!(name = %stat.name, "skipping node without tar representation");
                continue;
            }
            self.append_node(&mut builder, cas, stat).await?;
        }

        let mut inner = builder.into_inner().await?;
        inner.shutdown().await?;
        Ok(())
    }
}

fn parse_mode(mode: &str) -> Result<u32, Error> {
    if mode.is_empty() {
        return Ok(0);
    }
    let digits = mode.strip_prefix("0o").unwrap_or(mode);
    u32::from_str_radix(digits, 8)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn parse_id(id: &str) -> Result<u64, Error> {
    if id.is_empty() {
        return Ok(0);
    }
    id.parse()
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn too_large(what: &str, value: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("{what} {value:?} does not fit the selected tar format"),
    ))
}

/// Encodes PAX records as `"%d key=value\n"`, the length field counting
/// the whole record including itself.
fn encode_pax_records(records: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in records {
        let rest = key.len() + value.len() + 3; // space, '=', '\n'
        let mut total = rest + decimal_len(rest);
        total = rest + decimal_len(total);
        out.extend_from_slice(format!("{total} {key}=").as_bytes());
        out.extend_from_slice(value);
        out.push(b'\n');
    }
    out
}

fn decimal_len(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

fn pax_header_name(name: &str) -> String {
    truncate_to(&format!("PaxHeaders.0/{name}"), 100)
}

fn truncate_name(name: &str) -> String {
    truncate_to(name, 100)
}

fn truncate_to(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pax_record_encoding_counts_itself() {
        let records = vec![("path".to_string(), b"some/file".to_vec())];
        let encoded = encode_pax_records(&records);
        // "18 path=some/file\n" is 18 bytes long.
        assert_eq!(encoded, b"18 path=some/file\n");
    }

    #[test]
    fn pax_record_encoding_handles_digit_boundary() {
        // a record whose length lands exactly where the digit count
        // changes the total.
        let value = vec![b'x'; 89];
        let records = vec![("k".to_string(), value)];
        let encoded = encode_pax_records(&records);
        let text = String::from_utf8(encoded.clone()).unwrap();
        let (len, _) = text.split_once(' ').unwrap();
        assert_eq!(len.parse::<usize>().unwrap(), encoded.len());
    }

    #[test]
    fn mode_parses_canonical_form() {
        assert_eq!(parse_mode("0o755").unwrap(), 0o755);
        assert_eq!(parse_mode("644").unwrap(), 0o644);
        assert_eq!(parse_mode("").unwrap(), 0);
        assert!(parse_mode("0o9z").is_err());
    }

    #[tokio::test]
    async fn entry_names_are_relative_to_root() {
        let sink = TarSink::new(
            Box::new(std::io::Cursor::new(Vec::new())),
            TarFormat::Pax,
            String::new(),
            "SCHILY.xattr.".to_string(),
        );
        assert_eq!(sink.entry_name("/a.txt", false), "a.txt");
        assert_eq!(sink.entry_name("/b", true), "b/");
    }

    #[tokio::test]
    async fn entry_names_gain_configured_root() {
        let sink = TarSink::new(
            Box::new(std::io::Cursor::new(Vec::new())),
            TarFormat::Pax,
            "/".to_string(),
            "SCHILY.xattr.".to_string(),
        );
        assert_eq!(sink.entry_name("/a.txt", false), "/a.txt");
        assert_eq!(sink.entry_name("/", true), "/");
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("PAX".parse::<TarFormat>().unwrap(), TarFormat::Pax);
        assert_eq!("gnu".parse::<TarFormat>().unwrap(), TarFormat::Gnu);
        assert!("zip".parse::<TarFormat>().is_err());
    }
}
