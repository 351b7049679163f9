//! Versioned on-disk container for density atlases.
//!
//! One file holds the atlas header, the COUNTS section (raw angular
//! samples), and one named dense-array section per object type. Layout:
//!
//! ```text
//! bytes 0..4   magic  b"XMAT"
//! bytes 4..6   format version (u16, little endian)
//! bytes 6..    bincode(ContainerFile)
//! ```
//!
//! Every map section is checked against the header's grid order and pixel
//! count on read, so a truncated or mismatched file fails loudly instead of
//! yielding a map of the wrong geometry.

use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::atlas::{Atlas, CoordFrame, CountSample, DensityMap};
use crate::healpix::HealpixGrid;
use crate::xmatch_errors::XmatchError;

pub(crate) const MAGIC: &[u8; 4] = b"XMAT";
pub(crate) const FORMAT_VERSION: u16 = 1;

/// Section name of the raw-sample table.
pub(crate) const COUNTS_SECTION: &str = "COUNTS";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ContainerHeader {
    pub order: u32,
    pub n_pix: u64,
    pub frame: CoordFrame,
    pub database: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub edited: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum SectionData {
    Counts(Vec<CountSample>),
    Map(DensityMap),
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct NamedSection {
    pub name: String,
    pub data: SectionData,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ContainerFile {
    pub header: ContainerHeader,
    pub sections: Vec<NamedSection>,
}

pub(crate) fn write_atlas(atlas: &Atlas, path: &Utf8Path) -> Result<(), XmatchError> {
    let header = ContainerHeader {
        order: atlas.grid().order(),
        n_pix: atlas.grid().n_pix(),
        frame: atlas.frame(),
        database: atlas.database().to_string(),
        created: atlas.created(),
        edited: atlas.edited(),
    };

    let mut sections = vec![NamedSection {
        name: COUNTS_SECTION.to_string(),
        data: SectionData::Counts(atlas.counts().to_vec()),
    }];
    for (object_type, map) in atlas.maps() {
        sections.push(NamedSection {
            name: object_type.clone(),
            data: SectionData::Map(map.clone()),
        });
    }

    let file = ContainerFile { header, sections };
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bincode::serialize_into(&mut bytes, &file)?;
    fs::write(path, bytes)?;
    Ok(())
}

pub(crate) fn read_atlas(path: &Utf8Path) -> Result<Atlas, XmatchError> {
    let bytes = fs::read(path)?;
    if bytes.len() < 6 || &bytes[0..4] != MAGIC {
        return Err(XmatchError::ContainerFormat(format!(
            "{path} is not an atlas container (bad magic)"
        )));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(XmatchError::ContainerFormat(format!(
            "unsupported container version {version} (expected {FORMAT_VERSION})"
        )));
    }

    let file: ContainerFile = bincode::deserialize(&bytes[6..])?;
    let grid = HealpixGrid::new(file.header.order)?;
    if grid.n_pix() != file.header.n_pix {
        return Err(XmatchError::ContainerFormat(format!(
            "header pixel count {} does not match order {}",
            file.header.n_pix, file.header.order
        )));
    }

    let mut counts: Option<Vec<CountSample>> = None;
    let mut maps = std::collections::BTreeMap::new();
    for section in file.sections {
        match section.data {
            SectionData::Counts(samples) => counts = Some(samples),
            SectionData::Map(map) => {
                if map.order() != file.header.order {
                    return Err(XmatchError::ContainerFormat(format!(
                        "map section {} was built at order {}, expected {}",
                        section.name,
                        map.order(),
                        file.header.order
                    )));
                }
                if map.values().len() as u64 != grid.n_pix() {
                    return Err(XmatchError::ContainerFormat(format!(
                        "map section {} has {} values, expected {}",
                        section.name,
                        map.values().len(),
                        grid.n_pix()
                    )));
                }
                maps.insert(section.name, map);
            }
        }
    }
    let counts = counts.ok_or_else(|| {
        XmatchError::ContainerFormat(format!("{path} is missing the {COUNTS_SECTION} section"))
    })?;

    Ok(Atlas::from_parts(
        grid,
        file.header.frame,
        file.header.database,
        file.header.created,
        file.header.edited,
        counts,
        maps,
    ))
}
