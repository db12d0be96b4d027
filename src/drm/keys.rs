//! 密钥派生。
//!
//! 1. `sha256(user_id + item_id + branch_id)` 的十六进制串取 `[7, 23)` 共 16 个字符，
//!    按 ASCII 字节作为 AES-128 密钥；
//! 2. borrow_key 经 base64 解码，前 16 字节为 IV，其余为密文，AES-128-CBC/PKCS#7 解密得到
//!    解包密钥（UTF-8 文本）；
//! 3. 解包密钥分别经 SHA-384 与 SHA-512（或 SHA-1）摘要，取十六进制串的固定区间作为
//!    文档密码与压缩包密码。
//!
//! 各区间是厂商格式的固定常量，没有校验手段，必须逐位保持。

use std::ops::Range;

use aes::Aes128;
use base64::prelude::{BASE64_STANDARD, Engine as _};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{AcquireError, AcquireResult, UnwrapStage};

const CIPHER_KEY_RANGE: Range<usize> = 7..23;
const DOCUMENT_PASSWORD_RANGE: Range<usize> = 9..73;
const ARCHIVE_PASSWORD_RANGE: Range<usize> = 59..105;
const IV_LEN: usize = 16;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// 一次解包所需的全部密钥材料。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    pub unwrap_key: String,
    pub document_password: String,
    pub archive_password: String,
}

fn digest_hex<D: Digest>(input: &[u8]) -> String {
    hex::encode(D::digest(input))
}

/// 超出摘要长度的部分被截断（SHA-1 摘要只有 40 个字符，结果为空串）。
fn hex_slice(hex: &str, range: Range<usize>) -> String {
    let end = range.end.min(hex.len());
    let start = range.start.min(end);
    hex[start..end].to_string()
}

pub fn branch_cipher_key(user_id: &str, item_id: &str, branch_id: &str) -> [u8; 16] {
    let hex = digest_hex::<Sha256>(format!("{user_id}{item_id}{branch_id}").as_bytes());
    let mut key = [0u8; 16];
    key.copy_from_slice(&hex.as_bytes()[CIPHER_KEY_RANGE]);
    key
}

fn decode_borrow_key(borrow_key: &str) -> AcquireResult<Vec<u8>> {
    // 兼容 URL 安全字符、缺省填充与换行
    let mut cleaned: String = borrow_key
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let trimmed = cleaned.trim_end_matches('=').len();
    cleaned.truncate(trimmed);
    while cleaned.len() % 4 != 0 {
        cleaned.push('=');
    }
    BASE64_STANDARD.decode(cleaned.as_bytes()).map_err(|e| {
        AcquireError::unwrap_failed(UnwrapStage::KeyDerivation, format!("borrow key is not base64: {e}"))
    })
}

pub fn decrypt_borrow_key(key: &[u8; 16], borrow_key: &str) -> AcquireResult<String> {
    let raw = decode_borrow_key(borrow_key)?;
    if raw.len() <= IV_LEN {
        return Err(AcquireError::unwrap_failed(
            UnwrapStage::KeyDerivation,
            format!("borrow key too short ({} bytes)", raw.len()),
        ));
    }
    let (iv, ciphertext) = raw.split_at(IV_LEN);
    let plain = Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| {
            AcquireError::unwrap_failed(UnwrapStage::KeyDerivation, "borrow key decryption failed")
        })?;
    String::from_utf8(plain).map_err(|_| {
        AcquireError::unwrap_failed(UnwrapStage::KeyDerivation, "unwrap key is not valid UTF-8")
    })
}

pub fn document_password(unwrap_key: &str) -> String {
    hex_slice(&digest_hex::<Sha384>(unwrap_key.as_bytes()), DOCUMENT_PASSWORD_RANGE)
}

pub fn archive_password(unwrap_key: &str, use_sha512: bool) -> String {
    let hex = if use_sha512 {
        digest_hex::<Sha512>(unwrap_key.as_bytes())
    } else {
        digest_hex::<Sha1>(unwrap_key.as_bytes())
    };
    hex_slice(&hex, ARCHIVE_PASSWORD_RANGE)
}

pub fn derive_keys(
    user_id: &str,
    item_id: &str,
    branch_id: &str,
    borrow_key: &str,
    archive_sha512: bool,
) -> AcquireResult<DerivedKeys> {
    let key = branch_cipher_key(user_id, item_id, branch_id);
    let unwrap_key = decrypt_borrow_key(&key, borrow_key)?;
    Ok(DerivedKeys {
        document_password: document_password(&unwrap_key),
        archive_password: archive_password(&unwrap_key, archive_sha512),
        unwrap_key,
    })
}
