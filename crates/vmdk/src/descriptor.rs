//! Textual descriptor handling: the extent list and CID metadata region.
//!
//! A descriptor is a small `key=value` text region, either embedded in a
//! sparse container (at the header's descriptor offset) or stored as a
//! standalone file that names the extent files composing the disk.

use crate::{DiskError, Result, SECTOR_SIZE};

/// Sentinel for "no CID recorded" / "no parent".
pub const CID_UNKNOWN: u32 = 0xffff_ffff;

/// Fixed size of the on-disk descriptor region, in sectors.
///
/// CID rewrites re-serialize into this many sectors, NUL-padded.
pub const DESC_REGION_SECTORS: u64 = 20;

pub const DESC_REGION_BYTES: usize = DESC_REGION_SECTORS as usize * SECTOR_SIZE;

/// Image subformat recorded in the descriptor's `createType` line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateType {
    MonolithicSparse,
    MonolithicFlat,
    TwoGbMaxExtentSparse,
    TwoGbMaxExtentFlat,
    StreamOptimized,
    Vmfs,
    VmfsSparse,
}

impl CreateType {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "monolithicSparse" => Self::MonolithicSparse,
            "monolithicFlat" => Self::MonolithicFlat,
            "twoGbMaxExtentSparse" => Self::TwoGbMaxExtentSparse,
            "twoGbMaxExtentFlat" => Self::TwoGbMaxExtentFlat,
            "streamOptimized" => Self::StreamOptimized,
            "vmfs" => Self::Vmfs,
            "vmfsSparse" => Self::VmfsSparse,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MonolithicSparse => "monolithicSparse",
            Self::MonolithicFlat => "monolithicFlat",
            Self::TwoGbMaxExtentSparse => "twoGbMaxExtentSparse",
            Self::TwoGbMaxExtentFlat => "twoGbMaxExtentFlat",
            Self::StreamOptimized => "streamOptimized",
            Self::Vmfs => "vmfs",
            Self::VmfsSparse => "vmfsSparse",
        }
    }

    /// Subformats whose virtual disk is split across multiple extent files.
    pub fn is_split(self) -> bool {
        matches!(self, Self::TwoGbMaxExtentSparse | Self::TwoGbMaxExtentFlat)
    }

    /// Subformats whose descriptor lives in a standalone file rather than
    /// embedded in a sparse container.
    pub fn has_descriptor_file(self) -> bool {
        matches!(
            self,
            Self::MonolithicFlat | Self::TwoGbMaxExtentSparse | Self::TwoGbMaxExtentFlat | Self::Vmfs
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExtentLineKind {
    /// Pre-allocated region at a byte offset (given in sectors) in its file.
    Flat { offset_sectors: u64 },
    Sparse,
}

/// One `RW <sectors> <TYPE> "<file>" [offset]` line of the extent list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtentLine {
    pub sectors: u64,
    pub kind: ExtentLineKind,
    pub file_name: String,
}

impl ExtentLine {
    pub fn to_line(&self) -> String {
        match self.kind {
            ExtentLineKind::Flat { offset_sectors } => {
                format!("RW {} FLAT \"{}\" {}", self.sectors, self.file_name, offset_sectors)
            }
            ExtentLineKind::Sparse => {
                format!("RW {} SPARSE \"{}\"", self.sectors, self.file_name)
            }
        }
    }
}

/// Parsed descriptor contents.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub version: u32,
    pub cid: u32,
    pub parent_cid: u32,
    pub create_type: CreateType,
    pub parent_file_name_hint: Option<String>,
    pub extents: Vec<ExtentLine>,
}

impl Descriptor {
    /// Parses descriptor text.
    ///
    /// Fails only on a missing or unsupported `createType`; extent lines that
    /// do not match the grammar, have non-`RW` access, or a non-positive size
    /// are skipped rather than rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let mut version = 1u32;
        let mut cid = CID_UNKNOWN;
        let mut parent_cid = CID_UNKNOWN;
        let mut create_type = None;
        let mut parent_file_name_hint = None;
        let mut extents = Vec::new();

        for line in descriptor_lines(text) {
            if let Some((key, value)) = split_key_value(line) {
                match key {
                    "version" => {
                        version = match value {
                            "1" => 1,
                            "2" => 2,
                            _ => return Err(DiskError::MalformedDescriptor("descriptor version")),
                        };
                    }
                    "CID" => cid = parse_hex(value).unwrap_or(CID_UNKNOWN),
                    "parentCID" => parent_cid = parse_hex(value).unwrap_or(CID_UNKNOWN),
                    "createType" => {
                        let name = unquote(value);
                        create_type = Some(
                            CreateType::from_name(name)
                                .ok_or(DiskError::MalformedDescriptor("unsupported createType"))?,
                        );
                    }
                    "parentFileNameHint" => {
                        parent_file_name_hint = Some(unquote(value).to_string());
                    }
                    // ddb.* and anything else is carried verbatim by CID
                    // rewrites but has no meaning to the engine.
                    _ => {}
                }
            } else if let Some(extent) = parse_extent_line(line) {
                extents.push(extent);
            }
        }

        let create_type =
            create_type.ok_or(DiskError::MalformedDescriptor("missing createType"))?;

        Ok(Self {
            version,
            cid,
            parent_cid,
            create_type,
            parent_file_name_hint,
            extents,
        })
    }
}

/// Parses one extent line; `None` means "skip this line".
pub fn parse_extent_line(line: &str) -> Option<ExtentLine> {
    let mut rest = line.trim();

    let access = take_token(&mut rest)?;
    if access != "RW" {
        return None;
    }

    let sectors: u64 = take_token(&mut rest)?.parse().ok()?;
    if sectors == 0 {
        return None;
    }

    let kind_token = take_token(&mut rest)?;
    let file_name = take_quoted(&mut rest)?;

    let kind = match kind_token {
        "FLAT" => ExtentLineKind::Flat {
            offset_sectors: take_token(&mut rest)?.parse().ok()?,
        },
        // VMFS extents behave as flat regions starting at the file head.
        "VMFS" => ExtentLineKind::Flat {
            offset_sectors: match take_token(&mut rest) {
                Some(tok) => tok.parse().ok()?,
                None => 0,
            },
        },
        "SPARSE" | "VMFSSPARSE" => ExtentLineKind::Sparse,
        _ => return None,
    };

    Some(ExtentLine {
        sectors,
        kind,
        file_name,
    })
}

/// Scans the fixed-size descriptor region for `CID=` or `parentCID=`.
///
/// Absence (or an unparsable value) yields [`CID_UNKNOWN`], never an error.
pub fn read_cid(region: &[u8], want_parent: bool) -> u32 {
    let text = region_text(region);
    let prefix = if want_parent { "parentCID=" } else { "CID=" };
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix(prefix) {
            if let Some(cid) = parse_hex(value.trim()) {
                return cid;
            }
        }
    }
    CID_UNKNOWN
}

/// Rewrites the `CID=` line in place, preserving every other line verbatim,
/// and re-serializes into a region of `region_len` bytes (NUL padding).
///
/// A well-formed descriptor always carries a `parentCID` line; its absence
/// means the region does not hold a descriptor at all.
pub fn write_cid(region: &[u8], region_len: usize, new_cid: u32) -> Result<Vec<u8>> {
    let text = region_text(region);
    if !text
        .lines()
        .any(|l| l.trim_end_matches('\r').starts_with("parentCID="))
    {
        return Err(DiskError::InvalidDescriptor("missing parentCID line"));
    }

    let cid_line = format!("CID={:x}", new_cid);
    let mut out = String::with_capacity(text.len() + cid_line.len());
    let mut replaced = false;
    for line in text.lines() {
        let bare = line.trim_end_matches('\r');
        if !replaced && bare.starts_with("CID=") {
            out.push_str(&cid_line);
            replaced = true;
        } else if !replaced && bare.starts_with("parentCID=") {
            // Descriptor lost its CID line somewhere; reinstate it in the
            // canonical position just above parentCID.
            out.push_str(&cid_line);
            out.push('\n');
            out.push_str(line);
            replaced = true;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    let mut bytes = out.into_bytes();
    bytes.resize(region_len, 0);
    Ok(bytes)
}

/// Generates a complete descriptor for a freshly created image.
pub fn generate_descriptor(
    create_type: CreateType,
    cid: u32,
    parent_cid: u32,
    parent_file_name_hint: Option<&str>,
    capacity_sectors: u64,
    adapter_type: &str,
    extents: &[ExtentLine],
) -> String {
    let mut text = String::new();
    text.push_str("# Disk DescriptorFile\n");
    text.push_str("version=1\n");
    text.push_str(&format!("CID={:x}\n", cid));
    text.push_str(&format!("parentCID={:x}\n", parent_cid));
    if let Some(hint) = parent_file_name_hint {
        text.push_str(&format!("parentFileNameHint=\"{}\"\n", hint));
    }
    text.push_str(&format!("createType=\"{}\"\n", create_type.name()));
    text.push('\n');
    text.push_str("# Extent description\n");
    for extent in extents {
        text.push_str(&extent.to_line());
        text.push('\n');
    }
    text.push('\n');
    text.push_str("# The Disk Data Base\n");
    text.push_str("#DDB\n");
    text.push('\n');
    text.push_str("ddb.virtualHWVersion = \"4\"\n");
    text.push_str(&format!(
        "ddb.geometry.cylinders = \"{}\"\n",
        capacity_sectors / (16 * 63)
    ));
    text.push_str("ddb.geometry.heads = \"16\"\n");
    text.push_str("ddb.geometry.sectors = \"63\"\n");
    text.push_str(&format!("ddb.adapterType = \"{}\"\n", adapter_type));
    text
}

/// Region bytes up to the first NUL, as UTF-8 (lossy bytes are dropped by
/// line parsing rather than failing the whole region).
fn region_text(region: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = region.iter().position(|b| *b == 0).unwrap_or(region.len());
    String::from_utf8_lossy(&region[..end])
}

fn descriptor_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(|l| l.trim_end_matches('\r').trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    // A key is a single token; anything with interior whitespace is an extent
    // line (or garbage) and goes through the extent grammar instead.
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value.trim()))
}

fn parse_hex(value: &str) -> Option<u32> {
    let value = value.trim();
    let value = value.strip_prefix("0x").unwrap_or(value);
    u32::from_str_radix(value, 16).ok()
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"')
}

fn take_token<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    let (token, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(token)
}

fn take_quoted(rest: &mut &str) -> Option<String> {
    let trimmed = rest.trim_start();
    let inner = trimmed.strip_prefix('"')?;
    let end = inner.find('"')?;
    let name = inner[..end].to_string();
    *rest = &inner[end + 1..];
    Some(name)
}
