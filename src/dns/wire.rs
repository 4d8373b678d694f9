//! Minimal DNS wire format: one query shape, one answer walk
//!
//! This is intentionally not a resolver. The only query ever built is a
//! single-question recursive lookup, and the only parse walks the answer
//! section for a type-65 (HTTPS) record and extracts the `ech` SvcParam
//! (key 5) from its RDATA:
//!
//! ```text
//! RDATA := SvcPriority(2) TargetName (SvcParamKey(2) SvcParamLen(2) Value)*
//! ```
//!
//! Compression pointers (`0xC0 xx`) are honored when skipping owner
//! names; the walk never follows them, it only steps over them.

use crate::error::DnsError;

/// Resource record type for HTTPS service bindings
pub const TYPE_HTTPS: u16 = 65;

/// SvcParamKey carrying the ECH config list
const SVC_PARAM_ECH: u16 = 5;

const HEADER_LEN: usize = 12;

/// Build a recursive single-question query for `domain` with the given
/// QTYPE. The ID is fixed at 1; DoH transports carry no retransmission
/// ambiguity for it to disambiguate.
#[must_use]
pub fn build_query(domain: &str, qtype: u16) -> Vec<u8> {
    let mut query = Vec::with_capacity(HEADER_LEN + domain.len() + 6);
    // ID=1, RD=1, QDCOUNT=1
    query.extend_from_slice(&[0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0x00);
    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes()); // QCLASS=IN
    query
}

/// Extract the ECH config list from a DNS response carrying an HTTPS
/// record. Returns the raw octet string from the `ech` SvcParam.
pub fn extract_ech_config(response: &[u8]) -> Result<Vec<u8>, DnsError> {
    if response.len() < HEADER_LEN {
        return Err(DnsError::Malformed("response shorter than header"));
    }
    let ancount = u16::from_be_bytes([response[6], response[7]]);
    if ancount == 0 {
        return Err(DnsError::Malformed("no answer records"));
    }

    // Skip the question section: QNAME, QTYPE, QCLASS
    let mut offset = HEADER_LEN;
    while offset < response.len() && response[offset] != 0 {
        offset += response[offset] as usize + 1;
    }
    offset += 5;

    for _ in 0..ancount {
        if offset >= response.len() {
            break;
        }
        // Owner name: compression pointer or label sequence
        if response[offset] & 0xC0 == 0xC0 {
            offset += 2;
        } else {
            while offset < response.len() && response[offset] != 0 {
                offset += response[offset] as usize + 1;
            }
            offset += 1;
        }
        if offset + 10 > response.len() {
            break;
        }
        let rr_type = u16::from_be_bytes([response[offset], response[offset + 1]]);
        offset += 8; // TYPE, CLASS, TTL
        let rdlen = u16::from_be_bytes([response[offset], response[offset + 1]]) as usize;
        offset += 2;
        if offset + rdlen > response.len() {
            break;
        }
        let rdata = &response[offset..offset + rdlen];
        offset += rdlen;

        if rr_type == TYPE_HTTPS {
            if let Some(ech) = ech_from_https_rdata(rdata) {
                return Ok(ech);
            }
        }
    }

    Err(DnsError::NoEchConfig)
}

/// Walk HTTPS RDATA for SvcParamKey 5
fn ech_from_https_rdata(rdata: &[u8]) -> Option<Vec<u8>> {
    if rdata.len() < 2 {
        return None;
    }
    // SvcPriority, then TargetName (root is a single zero byte)
    let mut offset = 2;
    if offset < rdata.len() && rdata[offset] == 0 {
        offset += 1;
    } else {
        while offset < rdata.len() && rdata[offset] != 0 {
            offset += rdata[offset] as usize + 1;
        }
        offset += 1;
    }

    while offset + 4 <= rdata.len() {
        let key = u16::from_be_bytes([rdata[offset], rdata[offset + 1]]);
        let len = u16::from_be_bytes([rdata[offset + 2], rdata[offset + 3]]) as usize;
        offset += 4;
        if offset + len > rdata.len() {
            break;
        }
        if key == SVC_PARAM_ECH {
            return Some(rdata[offset..offset + len].to_vec());
        }
        offset += len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_layout() {
        let q = build_query("cloudflare-ech.com", TYPE_HTTPS);
        // Header
        assert_eq!(&q[..12], &[0, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        // QNAME labels
        assert_eq!(q[12], 14);
        assert_eq!(&q[13..27], b"cloudflare-ech");
        assert_eq!(q[27], 3);
        assert_eq!(&q[28..31], b"com");
        assert_eq!(q[31], 0);
        // QTYPE=65, QCLASS=IN
        assert_eq!(&q[32..36], &[0, 65, 0, 1]);
    }

    /// Build a response: header, echoed question, one answer whose owner
    /// name is a compression pointer to the question.
    fn response_with_answers(answers: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut r = vec![0x00, 0x01, 0x81, 0x80, 0x00, 0x01, 0, 0, 0x00, 0x00, 0x00, 0x00];
        r[7] = answers.len() as u8;
        // question: example.com HTTPS IN
        r.push(7);
        r.extend_from_slice(b"example");
        r.push(3);
        r.extend_from_slice(b"com");
        r.push(0);
        r.extend_from_slice(&[0, 65, 0, 1]);
        for (rr_type, rdata) in answers {
            r.extend_from_slice(&[0xC0, 0x0C]); // pointer to offset 12
            r.extend_from_slice(&rr_type.to_be_bytes());
            r.extend_from_slice(&[0, 1]); // IN
            r.extend_from_slice(&[0, 0, 0, 60]); // TTL
            r.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            r.extend_from_slice(rdata);
        }
        r
    }

    fn https_rdata(params: &[(u16, &[u8])]) -> Vec<u8> {
        let mut d = vec![0x00, 0x01, 0x00]; // priority 1, root target
        for (key, value) in params {
            d.extend_from_slice(&key.to_be_bytes());
            d.extend_from_slice(&(value.len() as u16).to_be_bytes());
            d.extend_from_slice(value);
        }
        d
    }

    #[test]
    fn extracts_ech_param() {
        let rdata = https_rdata(&[(1, b"h2"), (5, b"\x00\x08 echcfg!")]);
        let resp = response_with_answers(&[(TYPE_HTTPS, rdata)]);
        let ech = extract_ech_config(&resp).unwrap();
        assert_eq!(ech, b"\x00\x08 echcfg!");
    }

    #[test]
    fn skips_non_https_answers() {
        let a_rdata = vec![1, 2, 3, 4];
        let https = https_rdata(&[(5, b"list")]);
        let resp = response_with_answers(&[(1, a_rdata), (TYPE_HTTPS, https)]);
        assert_eq!(extract_ech_config(&resp).unwrap(), b"list");
    }

    #[test]
    fn https_record_without_ech_param() {
        let rdata = https_rdata(&[(1, b"h3"), (4, b"\x01\x02\x03\x04")]);
        let resp = response_with_answers(&[(TYPE_HTTPS, rdata)]);
        assert!(matches!(
            extract_ech_config(&resp),
            Err(DnsError::NoEchConfig)
        ));
    }

    #[test]
    fn uncompressed_owner_name() {
        let rdata = https_rdata(&[(5, b"xyz")]);
        let mut r = vec![0x00, 0x01, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0, 0, 0, 0];
        r.push(1);
        r.push(b'a');
        r.push(0);
        r.extend_from_slice(&[0, 65, 0, 1]);
        // answer with literal owner name
        r.push(1);
        r.push(b'a');
        r.push(0);
        r.extend_from_slice(&[0, 65, 0, 1, 0, 0, 0, 60]);
        r.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        r.extend_from_slice(&rdata);
        assert_eq!(extract_ech_config(&r).unwrap(), b"xyz");
    }

    #[test]
    fn rejects_short_and_empty_responses() {
        assert!(matches!(
            extract_ech_config(&[0, 1, 2]),
            Err(DnsError::Malformed(_))
        ));
        let empty = response_with_answers(&[]);
        assert!(matches!(
            extract_ech_config(&empty),
            Err(DnsError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_rdata_does_not_panic() {
        let mut resp = response_with_answers(&[(TYPE_HTTPS, https_rdata(&[(5, b"abcdef")]))]);
        resp.truncate(resp.len() - 3);
        assert!(extract_ech_config(&resp).is_err());
    }
}
