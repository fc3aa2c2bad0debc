/// Raw HCI LE scanning channel.
///
/// Opens an `AF_BLUETOOTH` raw socket next to BlueZ, configures LE scanning
/// and hands every advertising event up unparsed. Needs CAP_NET_RAW.
use log::{debug, warn};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

// ---- HCI / Bluetooth constants ----

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_HCI: libc::c_int = 1;
const HCI_CHANNEL_RAW: u16 = 0;
const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;
const HCI_MAX_EVENT_SIZE: usize = 260;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;
const HCI_EV_CMD_COMPLETE: u8 = 0x0E;
const HCI_EV_CMD_STATUS: u8 = 0x0F;
const HCI_EV_LE_META: u8 = 0x3E;
const HCI_COMMAND_DISALLOWED: u8 = 0x0C;

const fn hci_opcode(ogf: u16, ocf: u16) -> u16 {
    (ogf << 10) | ocf
}
const LE_SET_SCAN_PARAMS: u16 = hci_opcode(0x08, 0x000B);
const LE_SET_SCAN_ENABLE: u16 = hci_opcode(0x08, 0x000C);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Request scan responses from advertisers
    Active,
    Passive,
}

impl ScanMode {
    pub fn from_active(active: bool) -> Self {
        if active {
            ScanMode::Active
        } else {
            ScanMode::Passive
        }
    }
}

/// An open scanning channel on one interface. Dropping it stops scanning.
pub trait RadioChannel: Send {
    /// Wait up to `timeout` for the next raw event; Ok(None) when nothing arrived
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// Opens scanning channels; the seam between capture workers and the hardware
pub trait Radio: Send + Sync {
    fn open(&self, interface: u16, mode: ScanMode) -> io::Result<Box<dyn RadioChannel>>;
}

/// Radio backed by raw HCI sockets
#[derive(Debug, Default)]
pub struct HciRadio;

impl Radio for HciRadio {
    fn open(&self, interface: u16, mode: ScanMode) -> io::Result<Box<dyn RadioChannel>> {
        Ok(Box::new(HciChannel::open(interface, mode)?))
    }
}

#[derive(Debug)]
pub struct HciChannel {
    fd: OwnedFd,
    interface: u16,
}

impl HciChannel {
    /// Open hci<interface>, install the event filter and enable LE scanning
    pub fn open(interface: u16, mode: ScanMode) -> io::Result<Self> {
        // SAFETY: plain syscall with constant arguments, no pointers involved
        let raw = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                BTPROTO_HCI,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: interface,
            hci_channel: HCI_CHANNEL_RAW,
        };
        // SAFETY: `addr` is a live repr(C) sockaddr_hci and the length matches its size
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrHci as *const libc::sockaddr,
                mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // Event packets only: command completion plus LE meta events
        let filter = HciFilter {
            type_mask: 1 << HCI_EVENT_PKT,
            event_mask: [
                (1 << HCI_EV_CMD_COMPLETE) | (1 << HCI_EV_CMD_STATUS),
                1 << (HCI_EV_LE_META - 32),
            ],
            opcode: 0,
        };
        // SAFETY: `filter` is a live repr(C) hci_filter and the length matches its size
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                &filter as *const HciFilter as *const libc::c_void,
                mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut channel = HciChannel { fd, interface };

        // Parameters can only change while scanning is off; BlueZ may have it on
        if let Err(e) = channel.send_request(LE_SET_SCAN_ENABLE, &[0x00, 0x00]) {
            debug!("hci{}: disabling scan before setup failed: {}", interface, e);
        }

        let scan_type = match mode {
            ScanMode::Active => 0x01,
            ScanMode::Passive => 0x00,
        };
        let params: [u8; 7] = [
            scan_type,
            0x10, 0x00, // interval: 10ms (16 * 0.625ms)
            0x10, 0x00, // window: 10ms
            0x00,       // own address type: public
            0x00,       // filter policy: accept all
        ];
        let status = channel.send_request(LE_SET_SCAN_PARAMS, &params)?;
        if status != 0 {
            warn!(
                "hci{}: LE scan parameters rejected (status 0x{:02X}), keeping controller defaults",
                interface, status
            );
        }

        // Duplicate filtering off so repeated advertisements keep arriving
        let status = channel.send_request(LE_SET_SCAN_ENABLE, &[0x01, 0x00])?;
        if status != 0 && status != HCI_COMMAND_DISALLOWED {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("hci{}: LE scan enable failed with status 0x{:02X}", interface, status),
            ));
        }

        debug!("hci{}: {:?} LE scan enabled", interface, mode);
        Ok(channel)
    }

    fn write_command(&self, opcode: u16, params: &[u8]) -> io::Result<()> {
        let mut packet = Vec::with_capacity(4 + params.len());
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(params);

        // SAFETY: the pointer and length describe `packet`, which outlives the call
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Send an HCI command and wait for its completion; returns the status byte
    fn send_request(&mut self, opcode: u16, params: &[u8]) -> io::Result<u8> {
        self.write_command(opcode, params)?;

        let deadline = Instant::now() + COMMAND_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("hci{}: command 0x{:04X} timed out", self.interface, opcode),
                ));
            }
            let Some(event) = self.read_event(remaining)? else {
                continue;
            };
            if event.len() < 7 {
                continue;
            }
            // Command Complete: [04][0E][len][ncmd][opcode][status]
            if event[1] == HCI_EV_CMD_COMPLETE && u16::from_le_bytes([event[4], event[5]]) == opcode {
                return Ok(event[6]);
            }
            // Command Status: [04][0F][len][status][ncmd][opcode]
            if event[1] == HCI_EV_CMD_STATUS && u16::from_le_bytes([event[5], event[6]]) == opcode {
                return Ok(event[3]);
            }
        }
    }

    fn read_event(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: `pollfd` is a single valid entry on the stack, matching nfds = 1
        let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if ready < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(e);
        }
        if ready == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
        // SAFETY: the kernel writes at most `buf.len()` bytes into `buf`
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(e);
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("hci{} closed", self.interface),
            ));
        }
        Ok(Some(buf[..n as usize].to_vec()))
    }
}

impl RadioChannel for HciChannel {
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        self.read_event(timeout)
    }
}

impl Drop for HciChannel {
    fn drop(&mut self) {
        if let Err(e) = self.write_command(LE_SET_SCAN_ENABLE, &[0x00, 0x00]) {
            debug!("hci{}: disabling scan on close failed: {}", self.interface, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_match_the_le_controller_commands() {
        assert_eq!(LE_SET_SCAN_PARAMS, 0x200B);
        assert_eq!(LE_SET_SCAN_ENABLE, 0x200C);
    }

    #[test]
    fn scan_mode_follows_configuration() {
        assert_eq!(ScanMode::from_active(true), ScanMode::Active);
        assert_eq!(ScanMode::from_active(false), ScanMode::Passive);
    }

    #[test]
    fn kernel_structures_have_the_expected_layout() {
        assert_eq!(mem::size_of::<SockaddrHci>(), 6);
        assert_eq!(mem::size_of::<HciFilter>(), 16);
    }
}
