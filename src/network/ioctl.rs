//! Network interface ioctl queries
//!
//! Native SIOCGIFMTU lookup used to auto-detect the MTU of the bridge a
//! VNET interface attaches to.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::os::unix::io::AsRawFd;

// FreeBSD <net/if.h>: SIOCGIFMTU reads ifr_mtu from an ifreq
const SIOCGIFMTU: libc::c_ulong = 0xc0206933;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_mtu: libc::c_int,
    _pad: [u8; 12],
}

fn copy_ifname(dest: &mut [libc::c_char; libc::IF_NAMESIZE], name: &str) -> Result<()> {
    let name_cstr =
        CString::new(name).map_err(|_| Error::VnetBridgeDoesNotExist(name.to_string()))?;
    let name_bytes = name_cstr.as_bytes_with_nul();

    if name_bytes.len() > libc::IF_NAMESIZE {
        return Err(Error::VnetBridgeDoesNotExist(name.to_string()));
    }

    for (i, byte) in name_bytes.iter().enumerate() {
        dest[i] = *byte as libc::c_char;
    }
    Ok(())
}

/// Query the MTU of an interface
pub fn get_interface_mtu(name: &str) -> Result<u32> {
    use std::net::UdpSocket;

    let sock = UdpSocket::bind("0.0.0.0:0")
        .map_err(|_| Error::VnetBridgeDoesNotExist(name.to_string()))?;

    let mut req: IfReq = unsafe { std::mem::zeroed() };
    copy_ifname(&mut req.ifr_name, name)?;

    let result = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFMTU, &mut req) };
    if result < 0 {
        return Err(Error::VnetBridgeDoesNotExist(name.to_string()));
    }

    Ok(req.ifr_mtu as u32)
}

/// Check whether an interface exists on the host
pub fn interface_exists(name: &str) -> bool {
    get_interface_mtu(name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires a FreeBSD host with lo0
    fn test_loopback_mtu() {
        let mtu = get_interface_mtu("lo0").unwrap();
        assert!(mtu >= 1500);
    }

    #[test]
    fn test_overlong_name_rejected() {
        let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
        assert!(copy_ifname(&mut buf, "interface-name-way-too-long").is_err());
    }
}
