use snafu::{Backtrace, prelude::*};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtoError {
	#[snafu(display("bad packet magic {found:02x?}"))]
	BadMagic {
		found:     [u8; 2],
		backtrace: Backtrace,
	},
	#[snafu(display("unsupported header length {value}"))]
	BadHeaderLen {
		value:     u8,
		backtrace: Backtrace,
	},
	#[snafu(display("declared content length {declared} exceeds the {available} available bytes"))]
	Truncated {
		declared:  usize,
		available: usize,
		backtrace: Backtrace,
	},
	#[snafu(display("both cipher flags set"))]
	ExclusiveCiphers {
		backtrace: Backtrace,
	},
	#[snafu(display("reserved flag bits set in {value:#04x}"))]
	ReservedFlags {
		value:     u8,
		backtrace: Backtrace,
	},
	#[snafu(display("body of {len} bytes does not fit a single frame"))]
	OversizeBody {
		len:       usize,
		backtrace: Backtrace,
	},
	// Deliberately carries nothing about the ciphertext
	#[snafu(display("authenticated decryption failed"))]
	BadCrypto {
		backtrace: Backtrace,
	},
	#[snafu(display("gzip inflate failed"))]
	GzipInflate {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("gzip deflate failed"))]
	GzipDeflate {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("messagepack body did not decode"))]
	MsgpackDecode {
		source:    rmp_serde::decode::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("messagepack body did not encode"))]
	MsgpackEncode {
		source:    rmp_serde::encode::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("request body is not JSON"))]
	BadJson {
		source:    serde_json::Error,
		backtrace: Backtrace,
	},
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

// The codec traits demand this conversion; the frame codec itself
// never performs IO.
impl From<std::io::Error> for ProtoError {
	#[inline(always)]
	fn from(_source: std::io::Error) -> Self {
		#[cfg(debug_assertions)]
		panic!("IO error should not be created by From<io::Error>");
		#[cfg(not(debug_assertions))]
		{
			use snafu::IntoError as _;
			IoSnafu.into_error(_source)
		}
	}
}
