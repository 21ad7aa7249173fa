//! DNS wire helpers.
//!
//! The engine forwards messages opaquely. The only parts it looks at are the
//! 12-byte header and the name and type of the first question, which together
//! form the cache key.

use std::fmt;

use crate::error::Error;

/// Length of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// Cache key derived from a query's question name and QTYPE.
///
/// Labels are compared byte for byte, so `Example.com` and `example.com` are
/// different signatures. QCLASS and the header ID are not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuerySignature(String);

impl QuerySignature {
    /// Derive the signature from a raw query.
    ///
    /// Fails on anything that is not a plain question: a packet shorter than
    /// the header, a label that runs past the end of the buffer, a compression
    /// pointer, a name with no labels or no root terminator, or missing QTYPE
    /// bytes.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < HEADER_LEN {
            return Err(Error::MalformedQuery("shorter than header"));
        }

        let mut pos = HEADER_LEN;
        let mut name = String::with_capacity(64);
        let mut labels = 0usize;

        loop {
            let Some(&len) = data.get(pos) else {
                return Err(Error::MalformedQuery("unterminated name"));
            };
            let label_len = len as usize;
            if label_len == 0 {
                pos += 1;
                break;
            }
            if label_len & 0xC0 != 0 {
                return Err(Error::MalformedQuery("compressed label in question"));
            }
            pos += 1;
            if pos + label_len > data.len() {
                return Err(Error::MalformedQuery("label overruns packet"));
            }
            if labels > 0 {
                name.push('.');
            }
            push_label(&mut name, &data[pos..pos + label_len]);
            labels += 1;
            pos += label_len;
        }

        if labels == 0 {
            return Err(Error::MalformedQuery("no labels in question"));
        }

        let Some(qtype) = data.get(pos..pos + 2) else {
            return Err(Error::MalformedQuery("missing query type"));
        };
        let qtype = u16::from_be_bytes([qtype[0], qtype[1]]);

        Ok(Self(format!("{name}|{qtype}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append a label in presentation form, escaping bytes that would make two
/// different names render the same.
fn push_label(out: &mut String, label: &[u8]) {
    for &b in label {
        match b {
            b'.' | b'\\' | b'|' => {
                out.push('\\');
                out.push(b as char);
            }
            0x21..=0x7E => out.push(b as char),
            _ => {
                out.push('\\');
                out.push_str(&format!("{b:03}"));
            }
        }
    }
}

/// Read the transaction ID from a message header.
pub fn message_id(data: &[u8]) -> Option<u16> {
    match data {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Stamp a cached response with the transaction ID of the query it now
/// answers.
///
/// This is the one place the forwarder departs from byte-for-byte relaying:
/// the first two bytes of a cached answer are replaced so that a client
/// asking again under a fresh ID accepts it. Nothing past the ID is touched.
pub fn with_message_id(mut response: Vec<u8>, id: u16) -> Vec<u8> {
    if response.len() >= 2 {
        response[..2].copy_from_slice(&id.to_be_bytes());
    }
    response
}
