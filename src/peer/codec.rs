//! BEP 3 wire framing: the handshake codec and the peer message codec.
//!
//! No teacher module contains this file (the retrieved `peer.rs`/`peer/mod.rs`
//! snapshots both `use codec::*` without the codec itself ever being
//! retrieved); reconstructed from the call sites in those snapshots
//! (`Handshake::new`, `PROTOCOL_STRING`, `HandshakeCodec`, `PeerCodec`,
//! `Message::{Bitfield,Choke,Unchoke,Interested,NotInterested,Have,Request,
//! Block,Cancel,KeepAlive}`) plus BEP 3's wire format directly, using
//! `tokio_util::codec::{Encoder, Decoder}` the same way the teacher already
//! depends on `tokio-util`'s `codec` feature.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::{BlockInfo, PeerId, PieceIndex, Sha1Hash, MAX_MSG_LEN};

/// The fixed protocol identifier string sent in every handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The BEP 3 handshake message.
#[derive(Clone, Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0u8; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Encodes/decodes the fixed-length handshake message, used only for the
/// very first exchange on a new connection before switching to `PeerCodec`.
pub(crate) struct HandshakeCodec;

const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.len() < 1 {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        if prot_len != 19 {
            return Err(Error::InvalidProtocolString);
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0u8; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidProtocolString);
        }
        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The BEP 3 message ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Block),
            8 => Ok(MessageId::Cancel),
            other => Err(Error::InvalidMessage(format!(
                "unknown message id {}",
                other
            ))),
        }
    }
}

/// A decoded peer wire message.
#[derive(Clone, Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(crate::Bitfield),
    Request(BlockInfo),
    Block { block_info: BlockInfo, data: Vec<u8> },
    Cancel(BlockInfo),
}

/// Encodes/decodes the length-prefixed message format used after the
/// handshake exchange completes.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(4);
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.reserve(9);
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.reserve(5 + bytes.len());
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(info) => {
                buf.reserve(17);
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Block { block_info, data } => {
                buf.reserve(13 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(block_info.piece_index as u32);
                buf.put_u32(block_info.offset);
                buf.put_slice(&data);
            }
            Message::Cancel(info) => {
                buf.reserve(17);
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;

            if len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if len > MAX_MSG_LEN {
                return Err(Error::InvalidMessage(format!(
                    "message length {} exceeds max {}",
                    len, MAX_MSG_LEN
                )));
            }

            if buf.len() < 4 + len {
                // not enough data buffered yet for the full frame
                buf.reserve(4 + len - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let id = MessageId::from_u8(buf.get_u8())?;
            let payload_len = len - 1;

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    let piece_index = buf.get_u32() as PieceIndex;
                    Message::Have { piece_index }
                }
                MessageId::Bitfield => {
                    let mut bytes = vec![0u8; payload_len];
                    buf.copy_to_slice(&mut bytes);
                    Message::Bitfield(crate::Bitfield::from_vec(bytes))
                }
                MessageId::Request => {
                    let piece_index = buf.get_u32() as PieceIndex;
                    let offset = buf.get_u32();
                    let len = buf.get_u32();
                    Message::Request(BlockInfo {
                        piece_index,
                        offset,
                        len,
                    })
                }
                MessageId::Block => {
                    let piece_index = buf.get_u32() as PieceIndex;
                    let offset = buf.get_u32();
                    let data_len = payload_len - 8;
                    let mut data = vec![0u8; data_len];
                    buf.copy_to_slice(&mut data);
                    Message::Block {
                        block_info: BlockInfo {
                            piece_index,
                            offset,
                            len: data_len as u32,
                        },
                        data,
                    }
                }
                MessageId::Cancel => {
                    let piece_index = buf.get_u32() as PieceIndex;
                    let offset = buf.get_u32();
                    let len = buf.get_u32();
                    Message::Cancel(BlockInfo {
                        piece_index,
                        offset,
                        len,
                    })
                }
            };

            return Ok(Some(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let mut buf = BytesMut::new();
        codec.encode(handshake.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, handshake.info_hash);
        assert_eq!(decoded.peer_id, handshake.peer_id);
    }

    #[test]
    fn test_handshake_rejects_bad_protocol_string() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"Not BitTorrent prot");
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&[0u8; 20]);
        buf.put_slice(&[0u8; 20]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_keep_alive_round_trip() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::KeepAlive)
        ));
    }

    #[test]
    fn test_request_round_trip() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let info = BlockInfo { piece_index: 3, offset: 16384, len: 16384 };
        codec.encode(Message::Request(info), &mut buf).unwrap();
        match codec.decode(&mut buf).unwrap() {
            Some(Message::Request(decoded)) => assert_eq!(decoded, info),
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_block_round_trip_with_payload() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let info = BlockInfo { piece_index: 1, offset: 0, len: 4 };
        let data = vec![1, 2, 3, 4];
        codec
            .encode(
                Message::Block { block_info: info, data: data.clone() },
                &mut buf,
            )
            .unwrap();
        match codec.decode(&mut buf).unwrap() {
            Some(Message::Block { block_info, data: decoded_data }) => {
                assert_eq!(block_info, info);
                assert_eq!(decoded_data, data);
            }
            other => panic!("expected Block, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Interested, &mut buf).unwrap();
        let mut partial = buf.split_to(3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MSG_LEN + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
