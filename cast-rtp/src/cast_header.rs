use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

/// Fixed part of the Cast header, with the reference frame id present.
pub const CAST_HEADER_LENGTH: usize = 7;
const CAST_HEADER_MIN_LENGTH: usize = 6;

const KEY_FRAME_BIT: u8 = 0x80;
const REFERENCE_FRAME_ID_BIT: u8 = 0x40;
const EXTENSION_COUNT_MASK: u8 = 0x3f;

const EXTENSION_TYPE_SHIFT: u16 = 10;
const EXTENSION_SIZE_MASK: u16 = 0x3ff;

/// Extension type carrying a new target playout delay in milliseconds.
pub const CAST_EXTENSION_ADAPTIVE_LATENCY: u8 = 1;

/// An extension in the Cast header, sent on the first packet of a frame only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastExtension {
    AdaptiveLatency { delay_ms: u16 },
    Unknown { kind: u8, data: Bytes },
}

impl CastExtension {
    fn body_len(&self) -> usize {
        match self {
            CastExtension::AdaptiveLatency { .. } => 2,
            CastExtension::Unknown { data, .. } => data.len(),
        }
    }

    fn kind(&self) -> u8 {
        match self {
            CastExtension::AdaptiveLatency { .. } => CAST_EXTENSION_ADAPTIVE_LATENCY,
            CastExtension::Unknown { kind, .. } => *kind,
        }
    }
}

/// The Cast framing header that follows the RTP header of every data packet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CastHeader {
    pub is_key_frame: bool,
    /// Low 8 bits of the frame id.
    pub frame_id: u8,
    pub packet_id: u16,
    pub max_packet_id: u16,
    /// Low 8 bits of the referenced frame id; absent when the R bit is clear.
    pub reference_frame_id: Option<u8>,
    pub extensions: Vec<CastExtension>,
}

impl CastHeader {
    /// New target playout delay carried by the adaptive latency extension, or 0.
    pub fn new_playout_delay_ms(&self) -> u16 {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                CastExtension::AdaptiveLatency { delay_ms } => Some(*delay_ms),
                _ => None,
            })
            .unwrap_or(0)
    }
}

impl MarshalSize for CastHeader {
    fn marshal_size(&self) -> usize {
        CAST_HEADER_MIN_LENGTH
            + usize::from(self.reference_frame_id.is_some())
            + self
                .extensions
                .iter()
                .map(|ext| 2 + ext.body_len())
                .sum::<usize>()
    }
}

impl Marshal for CastHeader {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |K|R| EXT_COUNT |    FRAME_ID   |           PACKET_ID           |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |         MAX_PACKET_ID         |  REF_FRAME_ID | ext type+size |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::ErrBufferShort);
        }
        if self.extensions.len() > EXTENSION_COUNT_MASK as usize {
            return Err(Error::ErrPacketTooBig);
        }

        let mut b0 = self.extensions.len() as u8;
        if self.is_key_frame {
            b0 |= KEY_FRAME_BIT;
        }
        if self.reference_frame_id.is_some() {
            b0 |= REFERENCE_FRAME_ID_BIT;
        }
        buf.put_u8(b0);
        buf.put_u8(self.frame_id);
        buf.put_u16(self.packet_id);
        buf.put_u16(self.max_packet_id);
        if let Some(reference_frame_id) = self.reference_frame_id {
            buf.put_u8(reference_frame_id);
        }

        for ext in &self.extensions {
            let body_len = ext.body_len();
            if body_len > EXTENSION_SIZE_MASK as usize {
                return Err(Error::ErrPacketTooBig);
            }
            buf.put_u16(((ext.kind() as u16) << EXTENSION_TYPE_SHIFT) | body_len as u16);
            match ext {
                CastExtension::AdaptiveLatency { delay_ms } => buf.put_u16(*delay_ms),
                CastExtension::Unknown { data, .. } => buf.put_slice(data),
            }
        }

        Ok(size)
    }
}

impl Unmarshal for CastHeader {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if raw_packet.remaining() < CAST_HEADER_MIN_LENGTH {
            return Err(Error::ErrCastHeaderSizeInsufficient);
        }

        let b0 = raw_packet.get_u8();
        let is_key_frame = (b0 & KEY_FRAME_BIT) != 0;
        let has_reference = (b0 & REFERENCE_FRAME_ID_BIT) != 0;
        let num_extensions = (b0 & EXTENSION_COUNT_MASK) as usize;

        let frame_id = raw_packet.get_u8();
        let packet_id = raw_packet.get_u16();
        let max_packet_id = raw_packet.get_u16();
        if max_packet_id < packet_id {
            return Err(Error::ErrCastHeaderInvalid);
        }

        let reference_frame_id = if has_reference {
            if !raw_packet.has_remaining() {
                return Err(Error::ErrCastHeaderSizeInsufficient);
            }
            Some(raw_packet.get_u8())
        } else {
            None
        };

        let mut extensions = Vec::with_capacity(num_extensions);
        for _ in 0..num_extensions {
            if raw_packet.remaining() < 2 {
                return Err(Error::ErrCastExtensionTruncated);
            }
            let type_and_size = raw_packet.get_u16();
            let kind = (type_and_size >> EXTENSION_TYPE_SHIFT) as u8;
            let size = (type_and_size & EXTENSION_SIZE_MASK) as usize;
            if raw_packet.remaining() < size {
                return Err(Error::ErrCastExtensionTruncated);
            }
            let mut body = raw_packet.copy_to_bytes(size);
            let ext = match kind {
                CAST_EXTENSION_ADAPTIVE_LATENCY if body.remaining() >= 2 => {
                    CastExtension::AdaptiveLatency {
                        delay_ms: body.get_u16(),
                    }
                }
                _ => CastExtension::Unknown { kind, data: body },
            };
            extensions.push(ext);
        }

        Ok(CastHeader {
            is_key_frame,
            frame_id,
            packet_id,
            max_packet_id,
            reference_frame_id,
            extensions,
        })
    }
}
