use bitflags::bitflags;

bitflags! {
	/// Flag byte of the packet header (LSB = bit 0).
	///
	/// Bits 4..=7 are reserved and must be zero on the wire.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct PacketFlags: u8 {
		const AES_GCM     = 1 << 0;
		const CHACHA_POLY = 1 << 1;
		const GUNZIP      = 1 << 2;
		const MSGPACK     = 1 << 3;
	}
}

impl PacketFlags {
	pub fn is_encrypted(self) -> bool {
		self.intersects(PacketFlags::AES_GCM | PacketFlags::CHACHA_POLY)
	}

	/// Human-readable transform trail, in the order the ingress side
	/// applies the transforms.
	pub fn describe(self) -> Vec<&'static str> {
		let mut applied = Vec::with_capacity(3);
		if self.contains(PacketFlags::AES_GCM) {
			applied.push("AES-256-GCM encrypted");
		} else if self.contains(PacketFlags::CHACHA_POLY) {
			applied.push("ChaCha20-Poly1305 encrypted");
		} else {
			applied.push("unencrypted");
		}
		if self.contains(PacketFlags::GUNZIP) {
			applied.push("GZIPped");
		}
		if self.contains(PacketFlags::MSGPACK) {
			applied.push("MSGPack");
		} else {
			applied.push("JSON");
		}
		applied
	}
}
