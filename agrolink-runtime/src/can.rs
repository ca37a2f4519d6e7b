use std::{io, os::unix::prelude::*, time::SystemTime};

use socket2::SockAddr;
use tokio::io::unix::AsyncFd;

use isobus::{CanFilter, Frame, FrameBuilder, Id, ID_BIT_MASK, PDU_MAX_LENGTH};

use crate::bus::FrameEvent;

pub struct SockAddrCAN {
    pub ifindex: u32,
}

impl SockAddrCAN {
    pub fn new(ifindex: u32) -> Self {
        Self { ifindex }
    }
}

impl From<&SockAddrCAN> for SockAddr {
    fn from(value: &SockAddrCAN) -> SockAddr {
        let mut sockaddr_can =
            unsafe { std::mem::MaybeUninit::<libc::sockaddr_can>::zeroed().assume_init() };
        sockaddr_can.can_family = libc::AF_CAN as u16;
        sockaddr_can.can_ifindex = value.ifindex as i32;

        let mut storage = std::mem::MaybeUninit::<libc::sockaddr_storage>::zeroed();
        unsafe { (storage.as_mut_ptr() as *mut libc::sockaddr_can).write(sockaddr_can) };

        unsafe {
            SockAddr::new(
                storage.assume_init(),
                std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            )
        }
    }
}

pub struct CanSocket(AsyncFd<socket2::Socket>);

impl CanSocket {
    /// Binds this socket to the specified CAN interface.
    pub fn bind(address: &SockAddrCAN) -> io::Result<Self> {
        let socket = socket2::Socket::new_raw(
            libc::AF_CAN.into(),
            socket2::Type::RAW,
            Some(libc::CAN_RAW.into()),
        )?;

        socket.bind(&address.into())?;
        socket.set_nonblocking(true)?;

        Ok(Self(AsyncFd::new(socket)?))
    }

    /// Sends a single frame on the socket to the CAN bus. On success,
    /// returns the number of bytes written.
    ///
    /// ISOBUS identifiers are always 29 bits wide, so the extended frame
    /// format flag is set unconditionally.
    pub async fn send(&self, frame: &Frame) -> io::Result<usize> {
        loop {
            let mut guard = self.0.writable().await?;

            let mut can_frame =
                unsafe { std::mem::MaybeUninit::<libc::can_frame>::zeroed().assume_init() };

            can_frame.can_id = frame.id().as_raw() | libc::CAN_EFF_FLAG;
            can_frame.can_dlc = frame.len() as u8;
            can_frame.data[..frame.len()].copy_from_slice(frame.pdu());

            let buf = unsafe {
                std::slice::from_raw_parts(
                    &can_frame as *const libc::can_frame as *const u8,
                    std::mem::size_of::<libc::can_frame>(),
                )
            };

            match guard.try_io(|inner| inner.get_ref().send(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Receives a single frame from the bus.
    ///
    /// Oversized frames never leave this layer; anything the controller hands
    /// us with more than 8 data bytes is dropped. Error frames are passed up
    /// flagged so that the dispatcher can route them to subscribers.
    pub async fn recv(&self) -> io::Result<FrameEvent> {
        loop {
            let mut guard = self.0.readable().await?;

            let mut storage = std::mem::MaybeUninit::<libc::can_frame>::zeroed();

            let buf_uninit = unsafe {
                std::slice::from_raw_parts_mut(
                    storage.as_mut_ptr() as *mut std::mem::MaybeUninit<u8>,
                    std::mem::size_of::<libc::can_frame>(),
                )
            };

            match guard.try_io(|inner| inner.get_ref().recv(buf_uninit)) {
                Ok(result) => {
                    result?;

                    let can_frame = unsafe { storage.assume_init() };
                    if can_frame.can_dlc as usize > PDU_MAX_LENGTH {
                        continue;
                    }

                    let frame = FrameBuilder::new(Id::new(can_frame.can_id & ID_BIT_MASK))
                        .copy_from_slice(&can_frame.data[..can_frame.can_dlc as usize])
                        .build();

                    return Ok(FrameEvent {
                        frame,
                        timestamp: SystemTime::now(),
                        error: can_frame.can_id & libc::CAN_ERR_FLAG != 0,
                    });
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Program the receive filter list into the kernel.
    ///
    /// The whole list is replaced in one call; there is no partially
    /// installed state. An empty list stops all reception.
    pub fn set_filters(&self, filters: &[CanFilter], err_mask: u32) -> io::Result<()> {
        let raw: Vec<libc::can_filter> = filters
            .iter()
            .map(|f| {
                let mut rf = libc::can_filter {
                    can_id: f.id,
                    can_mask: f.mask,
                };
                if f.inverted {
                    rf.can_id |= libc::CAN_INV_FILTER;
                }
                rf
            })
            .collect();

        unsafe {
            if libc::setsockopt(
                self.0.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_FILTER,
                raw.as_ptr() as *const libc::c_void,
                std::mem::size_of_val(&raw[..]) as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }

            let optval: libc::c_uint = err_mask;
            if libc::setsockopt(
                self.0.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_ERR_FILTER,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of_val(&optval) as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }

    /// Get the value of the `SO_ERROR` option on this socket.
    ///
    /// This will retrieve the stored error in the underlying socket, clearing
    /// the field in the process. This can be useful for checking errors between
    /// calls.
    #[inline]
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.0.get_ref().take_error()
    }
}

impl AsRawFd for CanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
