//! Encrypted API-key vault.
//!
//! A key circulates as `base64(AES-CBC(json(ApiKey)))`; that opaque
//! string is also the primary key of both vault tables, so membership
//! checks never decrypt. Keys enter the pending table together with
//! the message id of the external approval request and move to the
//! approved table atomically on approval.

use aes::Aes256;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bitflags::bitflags;
use cbc::cipher::{BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _, block_padding::Pkcs7};
use eyre::{WrapErr as _, eyre};
use rand::Rng as _;
use serde::{Deserialize, Serialize};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;
const KEY_ID_LEN: usize = 32;
const KEY_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pendingApiKeys
(
    base64repr TEXT PRIMARY KEY NOT NULL,
    messageId  BIGINT           NOT NULL
);
CREATE TABLE IF NOT EXISTS apiKeys
(
    base64repr TEXT PRIMARY KEY NOT NULL
);
";

bitflags! {
	/// Permission bitmask carried inside an [`ApiKey`]. Bit positions
	/// are part of the persisted format and must not move.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct ApiPermissions: u32 {
		const DISCORD_ID     = 1 << 0;
		const MINECRAFT_UUID = 1 << 2;
		const UUID_POST      = 1 << 3;
		const IP_ADDRESS     = 1 << 4;
	}
}

impl ApiPermissions {
	pub fn describe(self) -> Vec<&'static str> {
		self.iter_names().map(|(name, _)| name).collect()
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
	pub owner:       i64,
	pub permissions: u32,
	pub valid_until: String,
	pub key_id:      String,
}

impl ApiKey {
	/// Every constructed key gets its own random id.
	pub fn new(owner: i64, permissions: ApiPermissions) -> Self {
		let mut rng = rand::rng();
		let key_id = (0..KEY_ID_LEN)
			.map(|_| KEY_ID_CHARSET[rng.random_range(0..KEY_ID_CHARSET.len())] as char)
			.collect();
		Self {
			owner,
			permissions: permissions.bits(),
			valid_until: "INFINITE".to_owned(),
			key_id,
		}
	}

	pub fn permissions(&self) -> ApiPermissions {
		ApiPermissions::from_bits_truncate(self.permissions)
	}

	pub fn has_permissions(&self, required: ApiPermissions) -> bool {
		self.permissions().contains(required)
	}
}

#[derive(Clone)]
pub struct KeyVault {
	conn: tokio_rusqlite::Connection,
	key:  [u8; 32],
}

impl KeyVault {
	pub async fn open(path: impl AsRef<std::path::Path>, key: [u8; 32]) -> eyre::Result<Self> {
		let conn = tokio_rusqlite::Connection::open(path.as_ref())
			.await
			.wrap_err_with(|| format!("failed to open key vault {}", path.as_ref().display()))?;
		Self::init(conn, key).await
	}

	pub async fn open_in_memory(key: [u8; 32]) -> eyre::Result<Self> {
		let conn = tokio_rusqlite::Connection::open_in_memory()
			.await
			.wrap_err("failed to open in-memory key vault")?;
		Self::init(conn, key).await
	}

	async fn init(conn: tokio_rusqlite::Connection, key: [u8; 32]) -> eyre::Result<Self> {
		conn.call(|conn| Ok(conn.execute_batch(SCHEMA)?))
			.await
			.wrap_err("failed to create vault schema")?;
		Ok(Self { conn, key })
	}

	/// Wire/database form of a key.
	pub fn seal(&self, api_key: &ApiKey) -> eyre::Result<String> {
		let plain = serde_json::to_vec(api_key)?;
		let iv: [u8; IV_LEN] = rand::random();
		let ciphertext = Aes256CbcEnc::new_from_slices(&self.key, &iv)
			.map_err(|_| eyre!("vault key has the wrong length"))?
			.encrypt_padded_vec_mut::<Pkcs7>(&plain);

		let mut sealed = Vec::with_capacity(IV_LEN + ciphertext.len());
		sealed.extend_from_slice(&iv);
		sealed.extend_from_slice(&ciphertext);
		Ok(BASE64.encode(sealed))
	}

	pub fn open_key(&self, repr: &str) -> eyre::Result<ApiKey> {
		let raw = BASE64.decode(repr.trim()).wrap_err("api key is not base64")?;
		if raw.len() <= IV_LEN {
			return Err(eyre!("api key payload too short"));
		}
		let (iv, ciphertext) = raw.split_at(IV_LEN);
		let plain = Aes256CbcDec::new_from_slices(&self.key, iv)
			.map_err(|_| eyre!("vault key has the wrong length"))?
			.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
			.map_err(|_| eyre!("api key failed to decrypt"))?;
		Ok(serde_json::from_slice(&plain)?)
	}

	pub async fn add_pending(&self, repr: &str, message_id: i64) -> eyre::Result<()> {
		let repr = repr.to_owned();
		self.conn
			.call(move |conn| {
				Ok(conn.execute(
					"INSERT INTO pendingApiKeys (base64repr, messageId) VALUES (?1, ?2)",
					rusqlite::params![repr, message_id],
				)?)
			})
			.await?;
		Ok(())
	}

	/// Moves a key from pending to approved in one transaction.
	pub async fn promote(&self, repr: &str) -> eyre::Result<bool> {
		let repr = repr.to_owned();
		let moved = self
			.conn
			.call(move |conn| {
				let tx = conn.transaction()?;
				let inserted = tx.execute(
					"INSERT OR IGNORE INTO apiKeys (base64repr) \
					 SELECT base64repr FROM pendingApiKeys WHERE base64repr = ?1",
					[&repr],
				)?;
				tx.execute("DELETE FROM pendingApiKeys WHERE base64repr = ?1", [&repr])?;
				tx.commit()?;
				Ok(inserted > 0)
			})
			.await?;
		Ok(moved)
	}

	pub async fn drop_pending(&self, repr: &str) -> eyre::Result<bool> {
		let repr = repr.to_owned();
		let affected = self
			.conn
			.call(move |conn| {
				Ok(conn.execute("DELETE FROM pendingApiKeys WHERE base64repr = ?1", [repr])?)
			})
			.await?;
		Ok(affected > 0)
	}

	/// Membership check against the approved table; never decrypts.
	pub async fn is_valid(&self, repr: &str) -> eyre::Result<bool> {
		let repr = repr.to_owned();
		Ok(self
			.conn
			.call(move |conn| {
				Ok(conn.query_row(
					"SELECT EXISTS(SELECT 1 FROM apiKeys WHERE base64repr = ?1)",
					[repr],
					|row| row.get::<_, bool>(0),
				)?)
			})
			.await?)
	}

	pub async fn by_message_id(&self, message_id: i64) -> eyre::Result<Option<String>> {
		use rusqlite::OptionalExtension as _;
		Ok(self
			.conn
			.call(move |conn| {
				Ok(conn
					.query_row(
						"SELECT base64repr FROM pendingApiKeys WHERE messageId = ?1",
						[message_id],
						|row| row.get::<_, String>(0),
					)
					.optional()?)
			})
			.await?)
	}
}
