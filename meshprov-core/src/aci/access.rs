//! Access layer helpers: message opcodes and the composition data page 0 layout.

use crate::directory::{Element, ModelId};
use crate::error::{MeshError, Result};

/// Access opcode of the configuration server's composition data status message.
pub const COMPOSITION_DATA_STATUS: &[u8] = &[0x02];

/// Extract the 1, 2 or 3 byte access opcode from the head of a message.
pub fn opcode_from_message(data: &[u8]) -> Option<&[u8]> {
    let first = *data.first()?;
    let len = if first & 0x80 == 0 {
        1
    } else if first & 0x40 == 0 {
        2
    } else {
        3
    };
    data.get(..len)
}

/// Page 0 of a node's composition data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionData {
    pub company_id: u16,
    pub product_id: u16,
    pub version_id: u16,
    pub crpl: u16,
    pub features: u16,
    pub elements: Vec<Element>,
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() < len {
            return Err(MeshError::InvalidArgument(format!(
                "composition data truncated: needed {len} bytes, {left} left",
                left = self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

impl CompositionData {
    /// Decode a composition data status message, opcode included.
    pub fn from_status_message(message: &[u8]) -> Result<Self> {
        let body = message
            .strip_prefix(COMPOSITION_DATA_STATUS)
            .ok_or_else(|| {
                MeshError::InvalidArgument("not a composition data status message".to_string())
            })?;

        let mut reader = Reader { data: body };
        let page = reader.u8()?;
        if page != 0 {
            return Err(MeshError::InvalidArgument(format!(
                "unsupported composition data page {page}"
            )));
        }

        let company_id = reader.u16()?;
        let product_id = reader.u16()?;
        let version_id = reader.u16()?;
        let crpl = reader.u16()?;
        let features = reader.u16()?;

        let mut elements = Vec::new();
        while !reader.data.is_empty() {
            let location = reader.u16()?;
            let sig_count = reader.u8()?;
            let vendor_count = reader.u8()?;

            let mut models = Vec::with_capacity(usize::from(sig_count) + usize::from(vendor_count));
            for _ in 0..sig_count {
                models.push(ModelId::sig(reader.u16()?));
            }
            for _ in 0..vendor_count {
                let company = reader.u16()?;
                models.push(ModelId::vendor(company, reader.u16()?));
            }

            elements.push(Element {
                index: elements.len() as u16,
                location,
                models,
            });
        }

        Ok(Self {
            company_id,
            product_id,
            version_id,
            crpl,
            features,
            elements,
        })
    }
}
