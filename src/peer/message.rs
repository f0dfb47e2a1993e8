use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use crate::product::{DataSeg, DataSegId, ProdIndex, ProdInfo, Timestamp};

/// PDU type identifiers in the peer wire protocol.
///
/// Every PDU starts with a one-byte id followed by a payload whose layout
/// is fixed per id. Id 0 is reserved and never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduId {
    /// Announce whether the sender has a path to the publisher.
    PubPathNotice = 1,
    /// Announce available product information.
    ProdInfoNotice = 2,
    /// Announce an available data segment.
    DataSegNotice = 3,
    /// Ask for a product's information.
    ProdInfoRequest = 4,
    /// Ask for a data segment's bytes.
    DataSegRequest = 5,
    /// Deliver product information.
    ProdInfo = 6,
    /// Deliver a data segment.
    DataSeg = 7,
}

impl TryFrom<u8> for PduId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PduId::PubPathNotice),
            2 => Ok(PduId::ProdInfoNotice),
            3 => Ok(PduId::DataSegNotice),
            4 => Ok(PduId::ProdInfoRequest),
            5 => Ok(PduId::DataSegRequest),
            6 => Ok(PduId::ProdInfo),
            7 => Ok(PduId::DataSeg),
            _ => Err(PeerError::InvalidPduId(value)),
        }
    }
}

/// A protocol data unit exchanged between peers.
///
/// All multibyte integers are big-endian. Strings are length-prefixed with
/// a 16-bit length and carry no terminator. A data segment's payload length
/// is derived from the product size and segment offset, so it needs no
/// length field of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    /// Whether the sender has a path to the publisher.
    PubPathNotice(bool),
    /// Product information is available from the sender.
    ProdInfoNotice(ProdIndex),
    /// A data segment is available from the sender.
    DataSegNotice(DataSegId),
    /// Request for product information.
    ProdInfoRequest(ProdIndex),
    /// Request for a data segment.
    DataSegRequest(DataSegId),
    /// Product information.
    ProdInfo(ProdInfo),
    /// A data segment.
    DataSeg(DataSeg),
}

impl Pdu {
    /// The PDU's type identifier.
    pub fn id(&self) -> PduId {
        match self {
            Pdu::PubPathNotice(_) => PduId::PubPathNotice,
            Pdu::ProdInfoNotice(_) => PduId::ProdInfoNotice,
            Pdu::DataSegNotice(_) => PduId::DataSegNotice,
            Pdu::ProdInfoRequest(_) => PduId::ProdInfoRequest,
            Pdu::DataSegRequest(_) => PduId::DataSegRequest,
            Pdu::ProdInfo(_) => PduId::ProdInfo,
            Pdu::DataSeg(_) => PduId::DataSeg,
        }
    }

    /// Whether this PDU is a notice.
    pub fn is_notice(&self) -> bool {
        matches!(
            self,
            Pdu::PubPathNotice(_) | Pdu::ProdInfoNotice(_) | Pdu::DataSegNotice(_)
        )
    }

    /// Encodes the PDU to bytes for transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Pdu::PubPathNotice(has_path) => {
                buf.put_u8(PduId::PubPathNotice as u8);
                buf.put_u8(u8::from(*has_path));
            }
            Pdu::ProdInfoNotice(index) => {
                buf.put_u8(PduId::ProdInfoNotice as u8);
                buf.put_u32(index.get());
            }
            Pdu::DataSegNotice(id) => {
                buf.put_u8(PduId::DataSegNotice as u8);
                buf.put_u32(id.prod_index.get());
                buf.put_u32(id.offset);
            }
            Pdu::ProdInfoRequest(index) => {
                buf.put_u8(PduId::ProdInfoRequest as u8);
                buf.put_u32(index.get());
            }
            Pdu::DataSegRequest(id) => {
                buf.put_u8(PduId::DataSegRequest as u8);
                buf.put_u32(id.prod_index.get());
                buf.put_u32(id.offset);
            }
            Pdu::ProdInfo(info) => {
                let name = info.name().as_bytes();
                buf.put_u8(PduId::ProdInfo as u8);
                buf.put_u32(info.index().get());
                buf.put_u16(name.len() as u16);
                buf.put_slice(name);
                buf.put_u32(info.size());
                buf.put_u64(info.created().secs);
                buf.put_u32(info.created().nanos);
            }
            Pdu::DataSeg(seg) => {
                buf.put_u8(PduId::DataSeg as u8);
                buf.put_u32(seg.id().prod_index.get());
                buf.put_u32(seg.id().offset);
                buf.put_u32(seg.prod_size());
                buf.put_slice(seg.data());
            }
        }

        buf.freeze()
    }

    /// Decodes one PDU from the front of `buf`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; the caller should read more bytes and retry.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Pdu>, PeerError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let id = PduId::try_from(buf[0])?;
        let frame_len = match id {
            PduId::PubPathNotice => 2,
            PduId::ProdInfoNotice | PduId::ProdInfoRequest => 5,
            PduId::DataSegNotice | PduId::DataSegRequest => 9,
            PduId::ProdInfo => {
                // id + index + name length prefix
                if buf.len() < 7 {
                    return Ok(None);
                }
                let name_len = u16::from_be_bytes([buf[5], buf[6]]) as usize;
                7 + name_len + 4 + 8 + 4
            }
            PduId::DataSeg => {
                // id + index + offset + product size
                if buf.len() < 13 {
                    return Ok(None);
                }
                let offset = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
                let prod_size = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);
                13 + usize::from(DataSeg::segment_size(prod_size, offset))
            }
        };

        if buf.len() < frame_len {
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len).freeze();
        frame.advance(1);

        let pdu = match id {
            PduId::PubPathNotice => match frame.get_u8() {
                0 => Pdu::PubPathNotice(false),
                1 => Pdu::PubPathNotice(true),
                other => {
                    return Err(PeerError::Protocol(format!(
                        "bad publisher-path flag: {}",
                        other
                    )))
                }
            },
            PduId::ProdInfoNotice => Pdu::ProdInfoNotice(ProdIndex::new(frame.get_u32())?),
            PduId::ProdInfoRequest => Pdu::ProdInfoRequest(ProdIndex::new(frame.get_u32())?),
            PduId::DataSegNotice => {
                let index = ProdIndex::new(frame.get_u32())?;
                Pdu::DataSegNotice(DataSegId::new(index, frame.get_u32()))
            }
            PduId::DataSegRequest => {
                let index = ProdIndex::new(frame.get_u32())?;
                Pdu::DataSegRequest(DataSegId::new(index, frame.get_u32()))
            }
            PduId::ProdInfo => {
                let index = ProdIndex::new(frame.get_u32())?;
                let name_len = frame.get_u16() as usize;
                let name_bytes = frame.copy_to_bytes(name_len);
                let name = std::str::from_utf8(&name_bytes)
                    .map_err(|_| PeerError::Protocol("product name is not UTF-8".into()))?
                    .to_string();
                let size = frame.get_u32();
                let created = Timestamp {
                    secs: frame.get_u64(),
                    nanos: frame.get_u32(),
                };
                Pdu::ProdInfo(ProdInfo::with_timestamp(index, name, size, created)?)
            }
            PduId::DataSeg => {
                let index = ProdIndex::new(frame.get_u32())?;
                let offset = frame.get_u32();
                let prod_size = frame.get_u32();
                let data = frame;
                Pdu::DataSeg(DataSeg::new(
                    DataSegId::new(index, offset),
                    prod_size,
                    data,
                )?)
            }
        };

        Ok(Some(pdu))
    }
}
