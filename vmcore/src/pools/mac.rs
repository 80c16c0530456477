//! MAC address generation (SPEC_FULL.md §4.A).
//!
//! Generates 48-bit addresses with the locally-administered bit set and the
//! multicast bit cleared in the first octet, matching the qemu backend's
//! `generate_mac` in the pack — swapped here for `rand` instead of a hash of
//! the vm id, since nothing requires the address to be deterministic.

use std::collections::HashSet;

use rand::Rng;

use crate::error::{CoreError, Result};

const MAX_ATTEMPTS: usize = 32;

pub struct MacPool;

impl MacPool {
    /// Generate a MAC not present in `taken`. `taken` should be every MAC
    /// currently recorded on a live [`crate::record::VmRecord`].
    pub fn allocate(taken: &HashSet<String>) -> Result<String> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ATTEMPTS {
            let mut octets = [0u8; 6];
            rng.fill(&mut octets);
            octets[0] = (octets[0] | 0x02) & 0xfe;
            let mac = format_mac(&octets);
            if !taken.contains(&mac) {
                return Ok(mac);
            }
        }
        Err(CoreError::MacExhausted(MAX_ATTEMPTS))
    }
}

fn format_mac(octets: &[u8; 6]) -> String {
    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_mac_has_locally_administered_bit_set() {
        let mac = MacPool::allocate(&HashSet::new()).unwrap();
        let first_octet = u8::from_str_radix(&mac[0..2], 16).unwrap();
        assert_eq!(first_octet & 0x02, 0x02, "locally-administered bit unset");
        assert_eq!(first_octet & 0x01, 0x00, "multicast bit set");
    }

    #[test]
    fn avoids_taken_addresses() {
        let mac = MacPool::allocate(&HashSet::new()).unwrap();
        let mut taken = HashSet::new();
        taken.insert(mac.clone());
        let second = MacPool::allocate(&taken).unwrap();
        assert_ne!(mac, second);
    }

    #[test]
    fn exhaustion_surfaces_resource_exhausted() {
        // Force every attempt to collide by pre-seeding `taken` with nothing
        // is not feasible (random space is huge), so this test instead
        // verifies the error path directly via a full address space stub is
        // skipped: MAX_ATTEMPTS against 2^47 addresses cannot realistically
        // be exercised without mocking the RNG, which the allocator does not
        // expose. Covered instead by a unit check on the kind mapping.
        let err = CoreError::MacExhausted(MAX_ATTEMPTS);
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);
    }
}
