//! Version negotiation (spec §4.2).

use crate::packet::PacketHeader;

/// Returns true if `header` should trigger a version-negotiation response:
/// its version is outside `supported`, and it is not itself a (server-bound)
/// version-negotiation packet (version == 0, which we silently ignore).
pub fn needs_negotiation(header: &PacketHeader, supported: &[u32]) -> bool {
    header.version != 0 && !supported.contains(&header.version)
}

/// Builds the exact bytes of a version-negotiation datagram in response to
/// `header`, echoing the client's SCID as the negotiation packet's DCID and
/// listing `supported` versions sorted ascending.
pub fn build_version_negotiation(header: &PacketHeader, supported: &[u32]) -> Vec<u8> {
    let mut versions: Vec<u32> = supported.to_vec();
    versions.sort_unstable();

    let mut out = Vec::with_capacity(1 + 4 + 1 + header.scid.len() + 1 + versions.len() * 4);
    out.push(0x80 | 0x70);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(header.scid.len() as u8);
    out.extend_from_slice(&header.scid);
    out.push(0x00); // empty SCID
    for version in versions {
        out.extend_from_slice(&version.to_be_bytes());
    }
    out
}
