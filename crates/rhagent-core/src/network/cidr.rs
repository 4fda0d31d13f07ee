//! IPv4 CIDR notation and the synthetic gateway rule.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use super::NetworkError;

/// An IPv4 host address together with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidCidr`] if `prefix_len` exceeds 32.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidCidr {
                input: format!("{address}/{prefix_len}"),
                reason: "prefix length exceeds 32".to_string(),
            });
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    #[must_use]
    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    #[must_use]
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    #[must_use]
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len))
            .unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    /// First address of the subnet.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & u32::from(self.netmask()))
    }

    /// Whether `addr` lies inside this subnet.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.netmask()) == u32::from(self.network())
    }

    /// Placeholder gateway for a VLAN that has none yet.
    ///
    /// The network address with its last octet replaced by
    /// `network_last + 255 - host_last` (mod 256). For a `/24` this is the
    /// mirror image of the host octet from the top of the range. For longer
    /// prefixes the result can fall outside the subnet; callers get it
    /// unchanged.
    #[must_use]
    pub fn synthetic_gateway(&self) -> Ipv4Addr {
        let mut octets = self.network().octets();
        let host = self.address.octets()[3];
        octets[3] = octets[3].wrapping_add(255).wrapping_sub(host);
        Ipv4Addr::from(octets)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| NetworkError::InvalidCidr {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (addr, prefix) = s.split_once('/').ok_or_else(|| invalid("missing prefix length"))?;
        let address: Ipv4Addr = addr
            .parse()
            .map_err(|_| invalid("not an IPv4 address"))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| invalid("prefix length is not a number"))?;
        Self::new(address, prefix_len).map_err(|_| invalid("prefix length exceeds 32"))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let c = cidr("10.0.5.7/24");
        assert_eq!(c.address(), Ipv4Addr::new(10, 0, 5, 7));
        assert_eq!(c.prefix_len(), 24);
        assert_eq!(c.network(), Ipv4Addr::new(10, 0, 5, 0));
        assert_eq!(c.to_string(), "10.0.5.7/24");
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for input in ["10.0.5.7", "10.0.5/24", "10.0.5.7/33", "10.0.5.7/x", "fe80::1/64", ""] {
            assert!(
                matches!(input.parse::<Ipv4Cidr>(), Err(NetworkError::InvalidCidr { .. })),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_synthetic_gateway_slash_24() {
        assert_eq!(
            cidr("192.168.50.10/24").synthetic_gateway(),
            Ipv4Addr::new(192, 168, 50, 245)
        );
        assert_eq!(
            cidr("10.0.5.7/24").synthetic_gateway(),
            Ipv4Addr::new(10, 0, 5, 248)
        );
    }

    #[test]
    fn test_synthetic_gateway_slash_28_leaves_subnet() {
        // 10.0.0.32/28 spans .32-.47; 32 + 255 - 37 wraps to .250.
        let c = cidr("10.0.0.37/28");
        let gateway = c.synthetic_gateway();
        assert_eq!(gateway, Ipv4Addr::new(10, 0, 0, 250));
        assert!(!c.contains(gateway));
    }

    #[test]
    fn test_synthetic_gateway_slash_16_keeps_third_octet_of_network() {
        assert_eq!(
            cidr("172.16.9.20/16").synthetic_gateway(),
            Ipv4Addr::new(172, 16, 0, 235)
        );
    }

    #[test]
    fn test_netmask_edges() {
        assert_eq!(cidr("1.2.3.4/0").netmask(), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(cidr("1.2.3.4/32").netmask(), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(cidr("1.2.3.4/0").network(), Ipv4Addr::new(0, 0, 0, 0));
    }

    proptest! {
        #[test]
        fn prop_slash_24_gateway_mirrors_host(a: u8, b: u8, c: u8, host: u8) {
            let addr = Ipv4Cidr::new(Ipv4Addr::new(a, b, c, host), 24).unwrap();
            let gateway = addr.synthetic_gateway();
            prop_assert!(addr.contains(gateway));
            prop_assert_eq!(gateway.octets()[3], 255 - host);
            prop_assert_eq!(addr.synthetic_gateway(), gateway);
        }

        #[test]
        fn prop_gateway_shares_network_prefix_above_last_octet(raw: u32, prefix in 0u8..=24) {
            let addr = Ipv4Cidr::new(Ipv4Addr::from(raw), prefix).unwrap();
            let network = addr.network().octets();
            let gateway = addr.synthetic_gateway().octets();
            prop_assert_eq!(&gateway[..3], &network[..3]);
        }
    }
}
