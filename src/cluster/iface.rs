//! Network interface lookup for `localNodeIface`

use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{SyncError, SyncResult};

/// First address of the interface called `name`, IPv4 preferred
#[cfg(unix)]
pub fn interface_address(name: &str) -> SyncResult<IpAddr> {
    let mut v4 = None;
    let mut v6 = None;

    unsafe {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut addrs) == -1 {
            return Err(SyncError::Io(io::Error::last_os_error()));
        }

        let mut cursor = addrs;
        while !cursor.is_null() {
            let entry = &*cursor;
            cursor = entry.ifa_next;

            if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
                continue;
            }
            if CStr::from_ptr(entry.ifa_name).to_string_lossy() != name {
                continue;
            }

            match (*entry.ifa_addr).sa_family as i32 {
                libc::AF_INET if v4.is_none() => {
                    let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    // s_addr is in network byte order
                    let octets = sin.sin_addr.s_addr.to_ne_bytes();
                    v4 = Some(IpAddr::V4(Ipv4Addr::from(octets)));
                }
                libc::AF_INET6 if v6.is_none() => {
                    let sin6 = &*(entry.ifa_addr as *const libc::sockaddr_in6);
                    v6 = Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)));
                }
                _ => {}
            }
        }

        libc::freeifaddrs(addrs);
    }

    v4.or(v6)
        .ok_or_else(|| SyncError::Config(format!("No address found for interface '{}'", name)))
}

#[cfg(not(unix))]
pub fn interface_address(name: &str) -> SyncResult<IpAddr> {
    Err(SyncError::Config(format!(
        "Interface lookup is not supported on this platform ({})",
        name
    )))
}
