//! Flag-driven body transforms.
//!
//! Ingress order is fixed: AEAD decrypt, gunzip, MessagePack decode.
//! Egress applies the inverse in reverse order, with a freshly sampled
//! nonce and the rebuilt header as associated data.

use std::io::{Read as _, Write as _};

use aes_gcm::{
	Aes256Gcm,
	aead::{Aead, AeadCore, KeyInit, Nonce, OsRng, Payload},
};
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use snafu::{ResultExt as _, ensure};

use crate::{
	BadCryptoSnafu, BadJsonSnafu, Frame, GzipDeflateSnafu, GzipInflateSnafu, HEADER_LEN,
	MsgpackDecodeSnafu, MsgpackEncodeSnafu, OversizeBodySnafu, PacketFlags, ProtoError,
	RequestKind, build_header,
};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Reverses the ingress transforms of `frame` and parses the result as
/// a JSON value.
pub fn open_frame(frame: &Frame, key: &[u8; 32]) -> Result<serde_json::Value, ProtoError> {
	let mut content: Vec<u8> = if frame.flags.contains(PacketFlags::AES_GCM) {
		decrypt::<Aes256Gcm>(&frame.body, &frame.header, key)?
	} else if frame.flags.contains(PacketFlags::CHACHA_POLY) {
		decrypt::<ChaCha20Poly1305>(&frame.body, &frame.header, key)?
	} else {
		frame.body.to_vec()
	};

	if frame.flags.contains(PacketFlags::GUNZIP) {
		content = gunzip(&content)?;
	}

	// A payload-less request reads as the empty object.
	if content.is_empty() {
		return Ok(serde_json::Value::Object(serde_json::Map::new()));
	}

	if frame.flags.contains(PacketFlags::MSGPACK) {
		rmp_serde::from_slice(&content).context(MsgpackDecodeSnafu)
	} else {
		serde_json::from_slice(&content).context(BadJsonSnafu)
	}
}

/// Builds a complete packet around `value`, applying the egress side of
/// the transforms selected by `flags`.
pub fn seal_frame(
	kind: RequestKind,
	flags: PacketFlags,
	value: &serde_json::Value,
	key: &[u8; 32],
) -> Result<Bytes, ProtoError> {
	let mut payload = if flags.contains(PacketFlags::MSGPACK) {
		rmp_serde::to_vec_named(value).context(MsgpackEncodeSnafu)?
	} else {
		serde_json::to_vec(value).context(BadJsonSnafu)?
	};

	if flags.contains(PacketFlags::GUNZIP) {
		payload = gzip(&payload)?;
	}

	// The header carries the length of the body as transmitted, so the
	// AEAD overhead has to be known before the header (the AAD) exists.
	let body_len = if flags.is_encrypted() {
		payload.len() + NONCE_LEN + TAG_LEN
	} else {
		payload.len()
	};
	ensure!(body_len <= u16::MAX as usize, OversizeBodySnafu { len: body_len });
	let header = build_header(kind, flags, body_len as u16);

	let body = if flags.contains(PacketFlags::AES_GCM) {
		encrypt::<Aes256Gcm>(&payload, &header, key)?
	} else if flags.contains(PacketFlags::CHACHA_POLY) {
		encrypt::<ChaCha20Poly1305>(&payload, &header, key)?
	} else {
		payload
	};

	let mut packet = BytesMut::with_capacity(HEADER_LEN as usize + body.len());
	packet.put_slice(&header);
	packet.put_slice(&body);
	Ok(packet.freeze())
}

fn decrypt<C>(body: &[u8], aad: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, ProtoError>
where
	C: Aead + KeyInit,
{
	ensure!(body.len() >= NONCE_LEN + TAG_LEN, BadCryptoSnafu);
	let (nonce, ciphertext) = body.split_at(NONCE_LEN);
	let cipher = C::new_from_slice(key).map_err(|_| BadCryptoSnafu.build())?;
	cipher
		.decrypt(Nonce::<C>::from_slice(nonce), Payload { msg: ciphertext, aad })
		.map_err(|_| BadCryptoSnafu.build())
}

fn encrypt<C>(payload: &[u8], aad: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, ProtoError>
where
	C: Aead + AeadCore + KeyInit,
{
	let nonce = C::generate_nonce(&mut OsRng);
	let cipher = C::new_from_slice(key).map_err(|_| BadCryptoSnafu.build())?;
	let ciphertext = cipher
		.encrypt(&nonce, Payload { msg: payload, aad })
		.map_err(|_| BadCryptoSnafu.build())?;

	let mut body = Vec::with_capacity(NONCE_LEN + ciphertext.len());
	body.extend_from_slice(&nonce);
	body.extend_from_slice(&ciphertext);
	Ok(body)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, ProtoError> {
	let mut out = Vec::new();
	GzDecoder::new(data)
		.read_to_end(&mut out)
		.context(GzipInflateSnafu)?;
	Ok(out)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, ProtoError> {
	let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
	encoder.write_all(data).context(GzipDeflateSnafu)?;
	encoder.finish().context(GzipDeflateSnafu)
}
