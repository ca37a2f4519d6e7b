//! CAN interface lookup and link-state monitoring.
//!
//! The monitor replaces kernel netdevice notifications with an explicit
//! registry: interested parties subscribe to an interface and receive
//! up/down/unregister events from a polling task.

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::broadcast;

const ARPHRD_CAN: libc::sa_family_t = 280;

fn ifreq(name: &str) -> io::Result<libc::ifreq> {
    let mut req = unsafe { std::mem::MaybeUninit::<libc::ifreq>::zeroed().assume_init() };

    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }
    for (i, byte) in bytes.iter().enumerate() {
        req.ifr_name[i] = *byte as libc::c_char;
    }

    Ok(req)
}

fn ioctl_ifreq(request: libc::c_ulong, req: &mut libc::ifreq) -> io::Result<()> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let rc = libc::ioctl(fd, request, req);
        libc::close(fd);

        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Resolve an interface name to its index.
pub fn index(name: &str) -> io::Result<u32> {
    let name_raw = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name"))?;

    match unsafe { libc::if_nametoindex(name_raw.as_ptr()) } {
        0 => Err(io::Error::last_os_error()),
        index => Ok(index),
    }
}

/// Whether the interface is administratively up.
pub fn is_up(name: &str) -> io::Result<bool> {
    let mut req = ifreq(name)?;
    ioctl_ifreq(libc::SIOCGIFFLAGS, &mut req)?;

    Ok(unsafe { req.ifr_ifru.ifru_flags } & libc::IFF_UP as libc::c_short != 0)
}

/// Whether the interface is a CAN device.
pub fn is_can(name: &str) -> io::Result<bool> {
    let mut req = ifreq(name)?;
    ioctl_ifreq(libc::SIOCGIFHWADDR, &mut req)?;

    Ok(unsafe { req.ifr_ifru.ifru_hwaddr.sa_family } == ARPHRD_CAN)
}

/// Link state change on a watched interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Up(u32),
    Down(u32),
    Unregister(u32),
}

struct Watched {
    name: String,
    index: u32,
    up: bool,
    present: bool,
}

struct MonitorInner {
    watched: Mutex<Vec<Watched>>,
    sender: broadcast::Sender<LinkEvent>,
}

/// Interface registry with link event subscriptions.
#[derive(Clone)]
pub struct LinkMonitor {
    inner: Arc<MonitorInner>,
}

impl LinkMonitor {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(MonitorInner {
                watched: Mutex::new(Vec::new()),
                sender,
            }),
        }
    }

    /// Watch an interface and subscribe to its link events.
    pub fn subscribe(&self, name: &str, index: u32) -> broadcast::Receiver<LinkEvent> {
        let up = is_up(name).unwrap_or(false);

        self.inner.watched.lock().unwrap().push(Watched {
            name: name.to_owned(),
            index,
            up,
            present: true,
        });

        self.inner.sender.subscribe()
    }

    /// Probe every watched interface once and emit the deltas.
    pub fn poll(&self) {
        let mut watched = self.inner.watched.lock().unwrap();

        for iface in watched.iter_mut() {
            if !iface.present {
                continue;
            }

            match index(&iface.name) {
                Ok(index) if index == iface.index => {
                    let up = is_up(&iface.name).unwrap_or(false);
                    if up != iface.up {
                        iface.up = up;
                        let event = if up {
                            LinkEvent::Up(iface.index)
                        } else {
                            LinkEvent::Down(iface.index)
                        };
                        let _ = self.inner.sender.send(event);
                    }
                }
                // Gone, or replaced by a new device under the same name.
                _ => {
                    iface.present = false;
                    let _ = self.inner.sender.send(LinkEvent::Unregister(iface.index));
                }
            }
        }
    }

    /// Poll on an interval.
    pub async fn watch(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            self.poll();
        }
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}
