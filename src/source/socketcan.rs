//! Linux SocketCAN driver.
//!
//! The interface bitrate belongs to the netdev (`ip link set can0 type can
//! bitrate 500000`); it is only logged here.

use super::hardware::{BusDriver, BusError, BusHandle, BusSettings, RawFrame};
use socketcan::{
    CanAnyFrame, CanFdSocket, CanFilter, CanFrame, CanSocket, EmbeddedFrame, Id, Socket,
    SocketOptions,
};
use std::io;
use std::time::Duration;
use tracing::{debug, info};

/// Smallest read timeout handed to the socket; zero would mean "block forever".
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct SocketCanDriver;

enum CanSocketKind {
    Classic(CanSocket),
    Fd(CanFdSocket),
}

struct SocketCanHandle {
    socket: CanSocketKind,
    timeout: Option<Duration>,
}

fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw(),
    }
}

fn to_raw<F: EmbeddedFrame>(frame: &F, is_error_frame: bool) -> RawFrame {
    RawFrame {
        arbitration_id: raw_id(frame.id()),
        data_length_code: frame.dlc() as u8,
        payload: frame.data().to_vec(),
        is_error_frame,
    }
}

fn classify(err: io::Error) -> Result<Option<RawFrame>, BusError> {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
            Ok(None)
        }
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            Err(BusError::Frame(err.to_string()))
        }
        _ => Err(BusError::Link(err.to_string())),
    }
}

impl SocketCanHandle {
    fn apply_timeout(&mut self, timeout: Duration) -> Result<(), BusError> {
        let timeout = timeout.max(MIN_READ_TIMEOUT);
        if self.timeout == Some(timeout) {
            return Ok(());
        }
        let result = match &self.socket {
            CanSocketKind::Classic(s) => s.set_read_timeout(timeout),
            CanSocketKind::Fd(s) => s.set_read_timeout(timeout),
        };
        result.map_err(|e| BusError::Link(e.to_string()))?;
        self.timeout = Some(timeout);
        Ok(())
    }
}

impl BusHandle for SocketCanHandle {
    fn recv(&mut self, timeout: Duration) -> Result<Option<RawFrame>, BusError> {
        self.apply_timeout(timeout)?;
        match &self.socket {
            CanSocketKind::Classic(socket) => match socket.read_frame() {
                Ok(CanFrame::Data(f)) => Ok(Some(to_raw(&f, false))),
                Ok(CanFrame::Remote(f)) => Ok(Some(to_raw(&f, false))),
                Ok(CanFrame::Error(f)) => Ok(Some(to_raw(&f, true))),
                Err(e) => classify(e),
            },
            CanSocketKind::Fd(socket) => match socket.read_frame() {
                Ok(CanAnyFrame::Normal(f)) => Ok(Some(to_raw(&f, false))),
                Ok(CanAnyFrame::Remote(f)) => Ok(Some(to_raw(&f, false))),
                Ok(CanAnyFrame::Fd(f)) => Ok(Some(to_raw(&f, false))),
                Ok(CanAnyFrame::Error(f)) => Ok(Some(to_raw(&f, true))),
                Err(e) => classify(e),
            },
        }
    }

    fn close(&mut self) {
        debug!("Dropping SocketCAN handle");
    }
}

impl BusDriver for SocketCanDriver {
    fn open(&mut self, settings: &BusSettings) -> Result<Box<dyn BusHandle>, BusError> {
        let filters: Vec<CanFilter> = settings
            .filters
            .iter()
            .map(|f| {
                let (id, mask) = f.kernel_id_mask();
                CanFilter::new(id, mask)
            })
            .collect();

        let socket = if settings.fd {
            let socket = CanFdSocket::open(&settings.interface)
                .map_err(|e| BusError::Link(e.to_string()))?;
            if !filters.is_empty() {
                socket
                    .set_filters(&filters)
                    .map_err(|e| BusError::Link(e.to_string()))?;
            }
            CanSocketKind::Fd(socket)
        } else {
            let socket =
                CanSocket::open(&settings.interface).map_err(|e| BusError::Link(e.to_string()))?;
            if !filters.is_empty() {
                socket
                    .set_filters(&filters)
                    .map_err(|e| BusError::Link(e.to_string()))?;
            }
            CanSocketKind::Classic(socket)
        };

        info!(
            interface = %settings.interface,
            bitrate = settings.bitrate,
            fd = settings.fd,
            filters = filters.len(),
            "SocketCAN handle opened"
        );

        Ok(Box::new(SocketCanHandle {
            socket,
            timeout: None,
        }))
    }
}
