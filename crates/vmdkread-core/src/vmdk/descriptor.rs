//! Text descriptor file parsing.
//!
//! The descriptor lists the extents making up a disk. The handle uses it to
//! recognize flat extent files, which carry no signature, and to report the
//! declared media size.

use std::path::Path;

use crate::error::{Error, Result};
use crate::io::FileIoPool;

use super::SECTOR_SIZE;

/// Kind of storage backing a descriptor extent line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentType {
    Flat,
    Sparse,
    Zero,
    Vmfs,
    VmfsSparse,
    VmfsRdm,
    VmfsRaw,
}

impl ExtentType {
    fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FLAT" => Ok(ExtentType::Flat),
            "SPARSE" => Ok(ExtentType::Sparse),
            "ZERO" => Ok(ExtentType::Zero),
            "VMFS" => Ok(ExtentType::Vmfs),
            "VMFSSPARSE" => Ok(ExtentType::VmfsSparse),
            "VMFSRDM" => Ok(ExtentType::VmfsRdm),
            "VMFSRAW" => Ok(ExtentType::VmfsRaw),
            _ => Err(Error::invalid_format(format!("unknown extent type: {}", s))),
        }
    }

    /// Extent data stored verbatim in its file.
    pub fn is_raw_data(self) -> bool {
        matches!(
            self,
            ExtentType::Flat | ExtentType::Vmfs | ExtentType::VmfsRdm | ExtentType::VmfsRaw
        )
    }
}

/// One extent line of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentDescriptor {
    /// Access mode: "RW", "RDONLY" or "NOACCESS".
    pub access: String,
    /// Size of the extent in sectors.
    pub size_sectors: u64,
    pub extent_type: ExtentType,
    /// File name, empty for ZERO extents.
    pub filename: String,
    /// Start of the extent data within the file, in sectors.
    pub offset: u64,
}

impl ExtentDescriptor {
    pub fn size_bytes(&self) -> Result<u64> {
        sectors_to_bytes(self.size_sectors, "extent size")
    }

    /// Start of the extent data within the file, in bytes.
    pub fn offset_bytes(&self) -> Result<u64> {
        sectors_to_bytes(self.offset, "extent offset")
    }

    /// Returns true if `name` refers to this extent's file.
    ///
    /// Pool entries are usually full paths while descriptors hold bare file
    /// names, so only the final path component is compared.
    pub fn matches_file(&self, name: &str) -> bool {
        if self.filename.is_empty() {
            return false;
        }
        let candidate = Path::new(name).file_name();
        let own = Path::new(&self.filename).file_name();
        candidate.is_some() && candidate == own
    }
}

/// Parsed descriptor file.
#[derive(Debug, Clone, Default)]
pub struct Descriptor {
    pub version: u32,
    /// Content ID.
    pub cid: u32,
    /// Parent content ID, `0xffffffff` when there is no parent.
    pub parent_cid: u32,
    /// Disk type, e.g. "twoGbMaxExtentSparse".
    pub create_type: String,
    pub extents: Vec<ExtentDescriptor>,
    pub cylinders: u64,
    pub heads: u32,
    pub sectors: u32,
    pub adapter_type: String,
}

impl Descriptor {
    /// Parses descriptor text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` on malformed extent lines or numeric values.
    pub fn parse(content: &str) -> Result<Self> {
        let mut descriptor = Descriptor {
            version: 1,
            parent_cid: 0xffff_ffff,
            ..Default::default()
        };

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with("RW ") || line.starts_with("RDONLY ") || line.starts_with("NOACCESS ") {
                descriptor.extents.push(parse_extent_line(line)?);
                continue;
            }

            let Some((key, value)) = parse_key_value(line) else {
                continue;
            };
            match key {
                "version" => descriptor.version = parse_number(key, value)?,
                "CID" => descriptor.cid = parse_hex(key, value)?,
                "parentCID" => descriptor.parent_cid = parse_hex(key, value)?,
                "createType" => descriptor.create_type = value.to_string(),
                "ddb.geometry.cylinders" => descriptor.cylinders = parse_number(key, value)?,
                "ddb.geometry.heads" => descriptor.heads = parse_number(key, value)?,
                "ddb.geometry.sectors" => descriptor.sectors = parse_number(key, value)?,
                "ddb.adapterType" => descriptor.adapter_type = value.to_string(),
                _ => {}
            }
        }

        Ok(descriptor)
    }

    /// Reads and parses the descriptor stored in a pool entry.
    pub fn read_from_pool(pool: &FileIoPool, entry: usize, maximum_size: u64) -> Result<Self> {
        let size = pool.size(entry)?;
        if size > maximum_size {
            return Err(Error::capacity_exceeded(format!(
                "descriptor size: {} exceeds maximum: {}",
                size, maximum_size
            )));
        }
        let size = usize::try_from(size)
            .map_err(|_| Error::capacity_exceeded("descriptor size exceeds maximum"))?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)?;
        data.resize(size, 0);
        pool.read_exact_at(entry, 0, &mut data)?;
        Self::parse(&String::from_utf8_lossy(&data))
    }

    /// Declared media size in bytes.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` if the extent sizes do not fit in 64 bits.
    pub fn media_size(&self) -> Result<u64> {
        self.extents.iter().try_fold(0u64, |total, e| {
            total
                .checked_add(e.size_bytes()?)
                .ok_or_else(|| Error::capacity_exceeded("media size exceeds maximum"))
        })
    }

    /// Extent whose file name matches `name`.
    pub fn find_extent(&self, name: &str) -> Option<&ExtentDescriptor> {
        self.extents.iter().find(|e| e.matches_file(name))
    }

    pub fn has_parent(&self) -> bool {
        self.parent_cid != 0xffff_ffff
    }
}

fn sectors_to_bytes(sectors: u64, what: &str) -> Result<u64> {
    sectors.checked_mul(SECTOR_SIZE).ok_or_else(|| {
        Error::capacity_exceeded(format!("{}: {} sectors exceeds maximum", what, sectors))
    })
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid_format(format!("invalid {}: {}", key, value)))
}

fn parse_hex(key: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value, 16)
        .map_err(|_| Error::invalid_format(format!("invalid {}: {}", key, value)))
}

/// Splits `key=value`, stripping surrounding quotes from the value.
fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key.trim(), value))
}

/// Parses `ACCESS SIZE TYPE ["FILENAME" [OFFSET]]`.
fn parse_extent_line(line: &str) -> Result<ExtentDescriptor> {
    let mut rest = line;
    let (Some(access), Some(size), Some(kind)) = (
        next_token(&mut rest),
        next_token(&mut rest),
        next_token(&mut rest),
    ) else {
        return Err(Error::invalid_format(format!("invalid extent line: {}", line)));
    };

    let size_sectors = parse_number("extent size", size)?;
    let extent_type = ExtentType::parse(kind)?;

    let rest = rest.trim();
    let (filename, offset) = if rest.is_empty() {
        if extent_type != ExtentType::Zero {
            return Err(Error::invalid_format(format!(
                "missing extent filename in: {}",
                line
            )));
        }
        (String::new(), 0)
    } else {
        let (filename, offset) = parse_quoted_filename_and_offset(rest)?;
        let offset = if offset.is_empty() {
            0
        } else {
            parse_number("extent offset", offset)?
        };
        (filename.to_string(), offset)
    };

    Ok(ExtentDescriptor {
        access: access.to_string(),
        size_sectors,
        extent_type,
        filename,
        offset,
    })
}

/// Splits the next whitespace-delimited token off the front of `s`.
fn next_token<'a>(s: &mut &'a str) -> Option<&'a str> {
    let trimmed = s.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (token, rest) = trimmed.split_at(end);
    *s = rest;
    Some(token)
}

fn parse_quoted_filename_and_offset(s: &str) -> Result<(&str, &str)> {
    let inner = s
        .strip_prefix('"')
        .ok_or_else(|| Error::invalid_format(format!("expected quoted filename, got: {}", s)))?;
    let (filename, rest) = inner
        .split_once('"')
        .ok_or_else(|| Error::invalid_format(format!("unclosed quote in: {}", s)))?;
    Ok((filename, rest.trim()))
}
