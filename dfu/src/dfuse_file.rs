//! The DfuSe file container (ST UM0391), stripped of its DFU suffix.

use log::warn;

use crate::error::DfuError;

const PREFIX_LEN: usize = 11;
const TARGET_PREFIX_LEN: usize = 274;
const ELEMENT_HEADER_LEN: usize = 8;

const PREFIX_SIGNATURE: &[u8; 5] = b"DfuSe";
const TARGET_SIGNATURE: &[u8; 6] = b"Target";
const FORMAT_REVISION: u8 = 0x01;

#[derive(Debug, PartialEq, Eq)]
pub struct DfuseImage {
    pub targets: Vec<DfuseTarget>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DfuseTarget {
    pub alt_setting: u8,
    pub name: Option<String>,
    pub elements: Vec<DfuseElement>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DfuseElement {
    pub address: u32,
    pub data: Vec<u8>,
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DfuError> {
        if len > self.data.len() {
            return Err(DfuError::Data(format!(
                "Corrupt DfuSe file: cannot read {} bytes from {} bytes",
                len,
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }
}

fn quad(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl DfuseImage {
    /// Parse a DfuSe container. The payload handed in here must already
    /// have the file prefix and DFU suffix stripped. Consumes exactly
    /// the declared targets and elements; leftover bytes draw a warning
    /// but are not fatal.
    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        if data.len()
            < PREFIX_LEN + TARGET_PREFIX_LEN + ELEMENT_HEADER_LEN
        {
            return Err(DfuError::Data(
                "File too small for a DfuSe file".into(),
            ));
        }

        let mut r = Reader { data };
        let prefix = r.take(PREFIX_LEN)?;
        if &prefix[0..5] != PREFIX_SIGNATURE {
            return Err(DfuError::Data(
                "No valid DfuSe signature".into(),
            ));
        }
        if prefix[5] != FORMAT_REVISION {
            return Err(DfuError::Data(format!(
                "DFU format revision {} not supported",
                prefix[5]
            )));
        }
        let n_targets = prefix[10];

        let mut targets = Vec::with_capacity(n_targets as usize);
        for _ in 0..n_targets {
            let header = r.take(TARGET_PREFIX_LEN)?;
            if &header[0..6] != TARGET_SIGNATURE {
                return Err(DfuError::Data(
                    "No valid target signature".into(),
                ));
            }
            let alt_setting = header[6];
            let name = if header[7] != 0 {
                let raw = &header[11..266];
                let end =
                    raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                Some(String::from_utf8_lossy(&raw[..end]).into_owned())
            } else {
                None
            };
            let n_elements = quad(&header[270..274]);

            let mut elements =
                Vec::with_capacity(n_elements.min(64) as usize);
            for _ in 0..n_elements {
                let eh = r.take(ELEMENT_HEADER_LEN)?;
                let address = quad(&eh[0..4]);
                let size = quad(&eh[4..8]) as usize;
                if size > r.remaining() {
                    return Err(DfuError::Data(
                        "File too small for element size".into(),
                    ));
                }
                let data = r.take(size)?.to_vec();
                elements.push(DfuseElement { address, data });
            }
            targets.push(DfuseTarget {
                alt_setting,
                name,
                elements,
            });
        }

        if r.remaining() != 0 {
            warn!("{} bytes leftover", r.remaining());
        }

        Ok(DfuseImage { targets })
    }

    /// Re-emit the container in wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());

        out.extend_from_slice(PREFIX_SIGNATURE);
        out.push(FORMAT_REVISION);
        out.extend_from_slice(&(self.total_size() as u32).to_le_bytes());
        out.push(self.targets.len() as u8);

        for target in &self.targets {
            out.extend_from_slice(TARGET_SIGNATURE);
            out.push(target.alt_setting);
            let named: u32 = target.name.is_some().into();
            out.extend_from_slice(&named.to_le_bytes());
            let mut name = [0u8; 255];
            if let Some(n) = &target.name {
                let bytes = n.as_bytes();
                let len = bytes.len().min(254);
                name[..len].copy_from_slice(&bytes[..len]);
            }
            out.extend_from_slice(&name);
            let target_size: u32 = target
                .elements
                .iter()
                .map(|e| (ELEMENT_HEADER_LEN + e.data.len()) as u32)
                .sum();
            out.extend_from_slice(&target_size.to_le_bytes());
            out.extend_from_slice(
                &(target.elements.len() as u32).to_le_bytes(),
            );
            for element in &target.elements {
                out.extend_from_slice(&element.address.to_le_bytes());
                out.extend_from_slice(
                    &(element.data.len() as u32).to_le_bytes(),
                );
                out.extend_from_slice(&element.data);
            }
        }
        out
    }

    fn total_size(&self) -> usize {
        PREFIX_LEN
            + self
                .targets
                .iter()
                .map(|t| {
                    TARGET_PREFIX_LEN
                        + t.elements
                            .iter()
                            .map(|e| ELEMENT_HEADER_LEN + e.data.len())
                            .sum::<usize>()
                })
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> DfuseImage {
        DfuseImage {
            targets: vec![DfuseTarget {
                alt_setting: 0,
                name: Some("Internal Flash".into()),
                elements: vec![
                    DfuseElement {
                        address: 0x0800_0000,
                        data: vec![0xAA; 256],
                    },
                    DfuseElement {
                        address: 0x0800_4000,
                        data: vec![0x55; 32],
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_round_trip() {
        let image = sample_image();
        let wire = image.serialize();
        let parsed = DfuseImage::parse(&wire).unwrap();
        assert_eq!(parsed, image);
    }

    #[test]
    fn test_unnamed_target() {
        let image = DfuseImage {
            targets: vec![DfuseTarget {
                alt_setting: 1,
                name: None,
                elements: vec![DfuseElement {
                    address: 0x2000_0000,
                    data: vec![1, 2, 3, 4],
                }],
            }],
        };
        let parsed = DfuseImage::parse(&image.serialize()).unwrap();
        assert_eq!(parsed.targets[0].name, None);
        assert_eq!(parsed.targets[0].alt_setting, 1);
    }

    #[test]
    fn test_bad_signature() {
        let mut wire = sample_image().serialize();
        wire[0] = b'X';
        assert!(DfuseImage::parse(&wire).is_err());
    }

    #[test]
    fn test_bad_revision() {
        let mut wire = sample_image().serialize();
        wire[5] = 0x02;
        assert!(DfuseImage::parse(&wire).is_err());
    }

    #[test]
    fn test_element_overruns_file() {
        let mut wire = sample_image().serialize();
        let len = wire.len();
        wire.truncate(len - 8);
        assert!(DfuseImage::parse(&wire).is_err());
    }

    #[test]
    fn test_leftover_bytes_not_fatal() {
        let mut wire = sample_image().serialize();
        wire.extend_from_slice(&[0u8; 7]);
        assert!(DfuseImage::parse(&wire).is_ok());
    }

    #[test]
    fn test_too_small() {
        assert!(DfuseImage::parse(b"DfuSe\x01").is_err());
    }
}
