//! Address allocation within a network prefix
//!
//! Addresses are handled as `Ipv6Addr` values, so two textual forms that expand
//! to the same bits compare equal no matter how their zero runs were compressed.

use std::collections::HashSet;
use std::net::Ipv6Addr;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::error::{Result, SnapError};

/// Bound on candidates drawn before an allocation gives up
pub const MAX_GENERATION_ATTEMPTS: usize = 100;

/// Parse an address string into its canonical form.
///
/// Accepts surrounding whitespace, brackets and a trailing `/len` suffix.
pub fn canonicalize(raw: &str) -> Result<Ipv6Addr> {
    let trimmed = raw.trim();
    let without_len = trimmed.split('/').next().unwrap_or(trimmed);
    let unbracketed = without_len
        .trim_start_matches('[')
        .trim_end_matches(']');

    unbracketed
        .parse::<Ipv6Addr>()
        .map_err(|_| SnapError::InvalidAddress(raw.to_string()))
}

fn network_mask(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        len if len >= 128 => u128::MAX,
        len => u128::MAX << (128 - u32::from(len)),
    }
}

/// Mask an address down to the base of its network
pub fn prefix_base(address: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(address) & network_mask(prefix_len))
}

/// Whether `address` lies inside `base/prefix_len`
pub fn in_prefix(address: Ipv6Addr, base: Ipv6Addr, prefix_len: u8) -> bool {
    prefix_base(address, prefix_len) == prefix_base(base, prefix_len)
}

fn validate_prefix_len(prefix_len: u8) -> Result<()> {
    if prefix_len > 128 {
        return Err(SnapError::InvalidAddress(format!(
            "prefix length {} is out of range",
            prefix_len
        )));
    }
    Ok(())
}

fn random_candidate<R: Rng>(rng: &mut R, base: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let mask = network_mask(prefix_len);
    let network = u128::from(base) & mask;
    let host = rng.gen::<u128>() & !mask;
    Ipv6Addr::from(network | host)
}

/// Stateless generator of addresses with fixed network bits and random host bits
pub struct AddressAllocator;

impl AddressAllocator {
    /// Draw an address in `base/prefix_len` that is not in `exclusion`
    pub fn generate(
        base: Ipv6Addr,
        prefix_len: u8,
        exclusion: &HashSet<Ipv6Addr>,
    ) -> Result<Ipv6Addr> {
        validate_prefix_len(prefix_len)?;
        let network = prefix_base(base, prefix_len);
        let mut rng = rand::thread_rng();

        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let candidate = random_candidate(&mut rng, network, prefix_len);
            // The all-zero host is the subnet-router anycast address
            if candidate == network && prefix_len < 127 {
                continue;
            }
            if !exclusion.contains(&candidate) {
                return Ok(candidate);
            }
        }

        Err(SnapError::AddressSpaceExhausted {
            prefix: format!("{}/{}", network, prefix_len),
            attempts: MAX_GENERATION_ATTEMPTS,
        })
    }

    /// Draw `count` distinct addresses, none of them in `exclusion`
    pub fn generate_many(
        base: Ipv6Addr,
        prefix_len: u8,
        count: usize,
        exclusion: &HashSet<Ipv6Addr>,
    ) -> Result<Vec<Ipv6Addr>> {
        let mut taken = exclusion.clone();
        let mut generated = Vec::with_capacity(count);

        for _ in 0..count {
            let address = Self::generate(base, prefix_len, &taken)?;
            taken.insert(address);
            generated.push(address);
        }

        Ok(generated)
    }
}

/// Addresses currently bound to any instance.
///
/// Every reservation is visible to the next allocation as soon as the call returns.
#[derive(Default)]
pub struct AddressPool {
    allocated: Mutex<HashSet<Ipv6Addr>>,
}

impl AddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a caller-chosen address as bound
    pub fn reserve(&self, address: Ipv6Addr) -> Result<()> {
        let mut allocated = self.allocated.lock();
        if !allocated.insert(address) {
            return Err(SnapError::AddressInUse {
                address: address.to_string(),
            });
        }
        debug!(address = %address, "Address reserved");
        Ok(())
    }

    /// Drop an address from the set. Releasing an unknown address is a no-op.
    pub fn release(&self, address: Ipv6Addr) -> bool {
        let removed = self.allocated.lock().remove(&address);
        if removed {
            debug!(address = %address, "Address released");
        }
        removed
    }

    pub fn release_many(&self, addresses: &[Ipv6Addr]) {
        let mut allocated = self.allocated.lock();
        for address in addresses {
            allocated.remove(address);
        }
    }

    /// Generate a fresh address and reserve it under the same lock
    pub fn allocate(&self, base: Ipv6Addr, prefix_len: u8) -> Result<Ipv6Addr> {
        let mut allocated = self.allocated.lock();
        let address = AddressAllocator::generate(base, prefix_len, &allocated)?;
        allocated.insert(address);
        Ok(address)
    }

    pub fn contains(&self, address: &Ipv6Addr) -> bool {
        self.allocated.lock().contains(address)
    }

    /// Copy of the allocated set, for generation outside the pool
    pub fn exclusion_set(&self) -> HashSet<Ipv6Addr> {
        self.allocated.lock().clone()
    }

    pub fn snapshot(&self) -> Vec<Ipv6Addr> {
        let mut addresses: Vec<_> = self.allocated.lock().iter().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.allocated.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_canonicalize_equates_compression_forms() {
        let expanded = canonicalize("2001:0db8:0000:0000:0000:0000:0000:0001").unwrap();
        let compressed = canonicalize("2001:db8::1").unwrap();
        let with_prefix = canonicalize(" 2001:db8:0:0::1/64 ").unwrap();
        let bracketed = canonicalize("[2001:db8::1]").unwrap();

        assert_eq!(expanded, compressed);
        assert_eq!(compressed, with_prefix);
        assert_eq!(compressed, bracketed);
        assert_eq!(expanded.to_string(), "2001:db8::1");
    }

    #[test]
    fn test_canonicalize_rejects_garbage() {
        assert!(matches!(
            canonicalize("192.168.1.1"),
            Err(SnapError::InvalidAddress(_))
        ));
        assert!(matches!(
            canonicalize("not an address"),
            Err(SnapError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_prefix_base_masks_host_bits() {
        assert_eq!(
            prefix_base(addr("2001:db8:1:2:3:4:5:6"), 64),
            addr("2001:db8:1:2::")
        );
        assert_eq!(prefix_base(addr("2001:db8::1"), 0), Ipv6Addr::UNSPECIFIED);
        assert_eq!(prefix_base(addr("2001:db8::1"), 128), addr("2001:db8::1"));
        assert_eq!(
            prefix_base(addr("2001:db8:ffff::"), 36),
            addr("2001:db8:f000::")
        );
    }

    #[test]
    fn test_generate_keeps_network_bits() {
        let base = addr("2001:db8:aa:bb::");
        let exclusion = HashSet::new();

        for _ in 0..50 {
            let generated = AddressAllocator::generate(base, 64, &exclusion).unwrap();
            assert!(in_prefix(generated, base, 64));
            assert_ne!(generated, base);
        }
    }

    #[test]
    fn test_generate_never_returns_excluded_address() {
        let base = addr("2001:db8::");
        // /126 leaves four candidates; exclude all but one usable host
        let exclusion: HashSet<_> = [addr("2001:db8::1"), addr("2001:db8::2")]
            .into_iter()
            .collect();

        for _ in 0..20 {
            let generated = AddressAllocator::generate(base, 126, &exclusion).unwrap();
            assert_eq!(generated, addr("2001:db8::3"));
        }
    }

    #[test]
    fn test_generate_exhausts_after_bounded_attempts() {
        let base = addr("2001:db8::5");
        let exclusion: HashSet<_> = [base].into_iter().collect();

        match AddressAllocator::generate(base, 128, &exclusion) {
            Err(SnapError::AddressSpaceExhausted { attempts, prefix }) => {
                assert_eq!(attempts, MAX_GENERATION_ATTEMPTS);
                assert_eq!(prefix, "2001:db8::5/128");
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_generate_rejects_out_of_range_prefix() {
        let result = AddressAllocator::generate(addr("2001:db8::"), 129, &HashSet::new());
        assert!(matches!(result, Err(SnapError::InvalidAddress(_))));
    }

    #[test]
    fn test_generate_many_returns_distinct_addresses() {
        let base = addr("2001:db8::");
        let exclusion: HashSet<_> = [addr("2001:db8::7")].into_iter().collect();

        let generated = AddressAllocator::generate_many(base, 120, 50, &exclusion).unwrap();
        let unique: HashSet<_> = generated.iter().copied().collect();

        assert_eq!(generated.len(), 50);
        assert_eq!(unique.len(), 50);
        assert!(!unique.contains(&addr("2001:db8::7")));
    }

    #[test]
    fn test_pool_release_is_idempotent() {
        let pool = AddressPool::new();
        let address = addr("2001:db8::10");

        assert!(!pool.release(address));

        pool.reserve(address).unwrap();
        assert!(pool.release(address));
        assert!(!pool.release(address));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_reserve_rejects_duplicates() {
        let pool = AddressPool::new();
        pool.reserve(addr("2001:db8::10")).unwrap();

        assert!(matches!(
            pool.reserve(addr("2001:0db8::0010")),
            Err(SnapError::AddressInUse { .. })
        ));
    }

    #[test]
    fn test_pool_allocation_is_visible_immediately() {
        let pool = AddressPool::new();
        let base = addr("2001:db8::");

        let first = pool.allocate(base, 126).unwrap();
        assert!(pool.contains(&first));

        let second = pool.allocate(base, 126).unwrap();
        let third = pool.allocate(base, 126).unwrap();
        let unique: HashSet<_> = [first, second, third].into_iter().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(pool.len(), 3);

        // Only the anycast base remains, which is never handed out
        assert!(matches!(
            pool.allocate(base, 126),
            Err(SnapError::AddressSpaceExhausted { .. })
        ));
        assert_eq!(pool.len(), 3);
    }
}
