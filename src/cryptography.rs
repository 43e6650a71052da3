use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use log::debug;
use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::error::TransferError;
use crate::{CRYPT_FRAME_SIZE, ENCRYPTION_OVERHEAD, KEY_SIZE, NONCE_SIZE};

/// Derives the PAKE session identity from the shared code phrase.
///
/// Both sides hash the code phrase the same way so the symmetric exchange
/// binds to the same identity.
pub fn create_session_id(code_phrase: u32) -> Identity {
    let mut hasher = Sha256::default();
    hasher.update(code_phrase.to_le_bytes());
    let result = hasher.finalize();
    Identity::new(&result)
}

/// One side of the password-authenticated key exchange.
///
/// Created with [`SharedSecret::start`], completed once with the peer's first
/// message, then read-only: [`SharedSecret::session_key`] is idempotent after
/// completion and fails with [`TransferError::KeyExchangeIncomplete`] before.
/// The derived key is never logged; this type deliberately does not implement
/// `Debug`.
pub struct SharedSecret {
    state: Mutex<Option<Spake2<Ed25519Group>>>,
    outbound: Vec<u8>,
    key: OnceLock<[u8; KEY_SIZE]>,
}

impl SharedSecret {
    /// Starts the symmetric SPAKE2 exchange for the given code phrase.
    pub fn start(code_phrase: u32, identity: &Identity) -> Self {
        let pw = Password::new(code_phrase.to_le_bytes());
        let (state, outbound) = Spake2::<Ed25519Group>::start_symmetric(&pw, identity);
        SharedSecret {
            state: Mutex::new(Some(state)),
            outbound,
            key: OnceLock::new(),
        }
    }

    /// The first-round message to hand to the peer.
    pub fn outbound_message(&self) -> &[u8] {
        &self.outbound
    }

    /// Finishes the exchange with the peer's first-round message and derives
    /// the session key. A no-op once a key exists.
    pub fn complete(&self, inbound_message: &[u8]) -> Result<(), TransferError> {
        let mut state = self.state.lock().expect("pake state lock");
        if self.key.get().is_some() {
            return Ok(());
        }
        let spake = state.take().ok_or(TransferError::KeyExchangeIncomplete)?;
        let shared = spake
            .finish(inbound_message)
            .map_err(|_| TransferError::Crypto)?;

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_ref());
        let mut session_key = [0u8; KEY_SIZE];
        hkdf.expand(b"file-transfer-session-key", &mut session_key)
            .expect("32 bytes is a valid length for HKDF");

        let _ = self.key.set(session_key);
        debug!("key exchange complete");
        Ok(())
    }

    /// The derived session key, identical on every call after completion.
    pub fn session_key(&self) -> Result<[u8; KEY_SIZE], TransferError> {
        self.key
            .get()
            .copied()
            .ok_or(TransferError::KeyExchangeIncomplete)
    }
}

/// Encrypts a small byte envelope (the metadata). The random nonce is
/// prepended to the returned ciphertext.
pub fn encrypt_bytes(plain: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, TransferError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let sealed = cipher.encrypt(&nonce, plain).map_err(|_| TransferError::Crypto)?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`encrypt_bytes`]. Fails with [`TransferError::Crypto`] on tag
/// mismatch or a truncated envelope.
pub fn decrypt_bytes(sealed: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, TransferError> {
    if sealed.len() < NONCE_SIZE + ENCRYPTION_OVERHEAD {
        return Err(TransferError::Crypto);
    }
    let (nonce, body) = sealed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| TransferError::Crypto)
}

/// Nonce for frame `index` of a file stream. Frames are sealed under one key
/// per transfer, so the counter keeps every nonce distinct.
fn frame_nonce(index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&index.to_le_bytes());
    nonce
}

fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream-encrypts `input` into `output` so the whole file is never resident
/// in memory. Each frame on disk is a big-endian u32 ciphertext length
/// followed by the ciphertext; the nonce comes from the frame counter.
pub fn encrypt_file(input: &Path, output: &Path, key: &[u8; KEY_SIZE]) -> Result<(), TransferError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);

    let mut buffer = vec![0u8; CRYPT_FRAME_SIZE];
    let mut frame: u64 = 0;
    loop {
        let bytes_read = read_full(&mut reader, &mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        let sealed = cipher
            .encrypt(Nonce::from_slice(&frame_nonce(frame)), &buffer[..bytes_read])
            .map_err(|_| TransferError::Crypto)?;
        writer.write_all(&(sealed.len() as u32).to_be_bytes())?;
        writer.write_all(&sealed)?;
        frame += 1;

        if bytes_read < CRYPT_FRAME_SIZE {
            break;
        }
    }
    writer.flush()?;
    debug!("encrypted {} frames", frame);
    Ok(())
}

/// Inverse of [`encrypt_file`]. Any bit flip in the stream fails with
/// [`TransferError::Crypto`], never silently corrupt plaintext; a truncated
/// or garbled frame header is treated the same way.
pub fn decrypt_file(input: &Path, output: &Path, key: &[u8; KEY_SIZE]) -> Result<(), TransferError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);

    let mut frame: u64 = 0;
    loop {
        let mut len_bytes = [0u8; 4];
        // A clean end of stream lands exactly between frames.
        let first = reader.read(&mut len_bytes[..1])?;
        if first == 0 {
            break;
        }
        reader
            .read_exact(&mut len_bytes[1..])
            .map_err(map_truncation)?;

        let sealed_len = u32::from_be_bytes(len_bytes) as usize;
        if sealed_len < ENCRYPTION_OVERHEAD || sealed_len > CRYPT_FRAME_SIZE + ENCRYPTION_OVERHEAD {
            return Err(TransferError::Crypto);
        }

        let mut sealed = vec![0u8; sealed_len];
        reader.read_exact(&mut sealed).map_err(map_truncation)?;

        let plain = cipher
            .decrypt(Nonce::from_slice(&frame_nonce(frame)), sealed.as_slice())
            .map_err(|_| TransferError::Crypto)?;
        writer.write_all(&plain)?;
        frame += 1;
    }
    writer.flush()?;
    debug!("decrypted {} frames", frame);
    Ok(())
}

fn map_truncation(err: io::Error) -> TransferError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        TransferError::Crypto
    } else {
        TransferError::Io(err)
    }
}
