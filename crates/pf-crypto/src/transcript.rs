//! Deterministic transcript encoding.
//!
//! Fields are appended as `(tag, len, bytes)` so the same logical data
//! always encodes to the same bytes. Certificates are signed over a
//! transcript and pairing proofs are computed over one.

use bytes::{BufMut, BytesMut};

use crate::hash::sha256;

const DOMAIN_TAG: u32 = 0;

#[derive(Clone, Debug, Default)]
pub struct Transcript {
    buf: BytesMut,
}

impl Transcript {
    /// Start a transcript bound to a domain separator.
    pub fn new(domain: &'static str) -> Self {
        let mut t = Self {
            buf: BytesMut::with_capacity(256),
        };
        t.append_str(DOMAIN_TAG, domain);
        t
    }

    pub fn append_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn append_u64(&mut self, tag: u32, v: u64) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(8);
        self.buf.put_u64(v);
        self
    }

    pub fn append_i64(&mut self, tag: u32, v: i64) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(8);
        self.buf.put_i64(v);
        self
    }

    pub fn append_str(&mut self, tag: u32, s: &str) -> &mut Self {
        self.append_bytes(tag, s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// SHA-256 of the transcript contents.
    pub fn digest(&self) -> [u8; 32] {
        sha256(&self.buf)
    }
}
