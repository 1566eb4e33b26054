use std::net::IpAddr;

/// Interface name prefixes that never carry the published-port address
const SKIP_PREFIXES: [&str; 3] = ["veth", "lo", "docker"];

/// Guess the address containers publish their ports on: the first address
/// of the first interface that is not a loopback, bridge, or veth pair
pub fn detect_host_ip() -> Option<IpAddr> {
    let interfaces = if_addrs::get_if_addrs().ok()?;
    pick_host_ip(interfaces.iter().map(|iface| (iface.name.as_str(), iface.ip())))
}

/// Interception rules are IPv4 `-d` matches, so an IPv4 address wins over
/// any IPv6 address that happens to enumerate first on a dual-stack host
fn pick_host_ip<'a>(addrs: impl IntoIterator<Item = (&'a str, IpAddr)>) -> Option<IpAddr> {
    let mut fallback = None;
    for (name, ip) in addrs {
        if SKIP_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            continue;
        }
        if ip.is_ipv4() {
            return Some(ip);
        }
        fallback.get_or_insert(ip);
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn skips_virtual_interfaces() {
        let addrs = [
            ("lo", v4(127, 0, 0, 1)),
            ("docker0", v4(172, 17, 0, 1)),
            ("veth81ca3e2", v4(169, 254, 0, 1)),
            ("eth0", v4(10, 0, 0, 5)),
        ];
        assert_eq!(pick_host_ip(addrs), Some(v4(10, 0, 0, 5)));
    }

    #[test]
    fn none_when_everything_is_virtual() {
        let addrs = [("lo", v4(127, 0, 0, 1)), ("docker0", v4(172, 17, 0, 1))];
        assert_eq!(pick_host_ip(addrs), None);
    }

    #[test]
    fn first_candidate_wins() {
        let addrs = [("eth0", v4(10, 0, 0, 5)), ("eth1", v4(10, 0, 1, 5))];
        assert_eq!(pick_host_ip(addrs), Some(v4(10, 0, 0, 5)));
    }

    #[test]
    fn ipv4_beats_earlier_ipv6() {
        let addrs = [
            ("eth0", "fe80::1".parse().unwrap()),
            ("eth0", v4(10, 0, 0, 5)),
        ];
        assert_eq!(pick_host_ip(addrs), Some(v4(10, 0, 0, 5)));
    }

    #[test]
    fn ipv6_only_as_a_last_resort() {
        let ipv6: IpAddr = "2001:db8::7".parse().unwrap();
        let addrs = [("lo", v4(127, 0, 0, 1)), ("eth0", ipv6)];
        assert_eq!(pick_host_ip(addrs), Some(ipv6));
    }
}
