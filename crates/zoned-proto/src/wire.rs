use bytes::{Buf, BufMut, Bytes};
use snafu::{OptionExt as _, ensure};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
	BadHeaderLenSnafu, BadMagicSnafu, ExclusiveCiphersSnafu, OversizeBodySnafu, PacketFlags,
	RequestKind, ReservedFlagsSnafu, TruncatedSnafu,
};

pub const MAGIC: [u8; 2] = *b"tz";
pub const HEADER_LEN: u8 = 7;

/// One on-wire packet, header retained byte-exact.
///
/// The retained header doubles as the AEAD associated data, so the
/// decoder never re-serializes it: `header` is the bytes as received
/// (or as built, on egress).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub kind:   RequestKind,
	pub flags:  PacketFlags,
	pub header: [u8; HEADER_LEN as usize],
	pub body:   Bytes,
}

impl Frame {
	pub fn new(kind: RequestKind, flags: PacketFlags, body: Bytes) -> Result<Self, crate::ProtoError> {
		ensure!(body.len() <= u16::MAX as usize, OversizeBodySnafu { len: body.len() });
		Ok(Self {
			header: build_header(kind, flags, body.len() as u16),
			kind,
			flags,
			body,
		})
	}
}

pub fn build_header(kind: RequestKind, flags: PacketFlags, content_len: u16) -> [u8; 7] {
	let len = content_len.to_be_bytes();
	[MAGIC[0], MAGIC[1], HEADER_LEN, kind.into(), flags.bits(), len[0], len[1]]
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
	type Error = crate::ProtoError;
	type Item = Frame;

	/// Decodes one complete packet.
	///
	/// Callers always hand over a full datagram or a fully read TCP
	/// request, so a short buffer is a protocol violation rather than
	/// a wait-for-more condition.
	fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		ensure!(
			src.len() >= HEADER_LEN as usize,
			TruncatedSnafu { declared: HEADER_LEN as usize, available: src.len() }
		);
		ensure!(src[0..2] == MAGIC, BadMagicSnafu { found: [src[0], src[1]] });
		ensure!(src[2] == HEADER_LEN, BadHeaderLenSnafu { value: src[2] });

		let flags = PacketFlags::from_bits(src[4]).context(ReservedFlagsSnafu { value: src[4] })?;
		ensure!(
			!flags.contains(PacketFlags::AES_GCM | PacketFlags::CHACHA_POLY),
			ExclusiveCiphersSnafu
		);

		let content_len = u16::from_be_bytes([src[5], src[6]]) as usize;
		ensure!(
			src.len() >= HEADER_LEN as usize + content_len,
			TruncatedSnafu {
				declared:  HEADER_LEN as usize + content_len,
				available: src.len(),
			}
		);

		let mut header = [0u8; HEADER_LEN as usize];
		header.copy_from_slice(&src[..HEADER_LEN as usize]);
		src.advance(HEADER_LEN as usize);
		let body = src.split_to(content_len).freeze();

		Ok(Some(Frame {
			kind: RequestKind::from(header[3]),
			flags,
			header,
			body,
		}))
	}
}

impl Encoder<Frame> for FrameCodec {
	type Error = crate::ProtoError;

	fn encode(&mut self, item: Frame, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
		ensure!(item.body.len() <= u16::MAX as usize, OversizeBodySnafu { len: item.body.len() });
		dst.reserve(HEADER_LEN as usize + item.body.len());
		dst.put_slice(&build_header(item.kind, item.flags, item.body.len() as u16));
		dst.put_slice(&item.body);
		Ok(())
	}
}
