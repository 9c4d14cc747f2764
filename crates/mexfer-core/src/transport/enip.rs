//! EtherNet/IP explicit messaging over TCP.
//!
//! Only what the generic message primitive needs: session registration,
//! unconnected messages (SendRRData, wrapped in Unconnected Send on routed
//! paths), one class 3 connection (Forward Open / SendUnitData / Forward
//! Close) and session teardown.

use std::io::{self, Cursor, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, warn};

use super::traits::{CipRequest, CipTransport, MessageMode, TransportError};
use crate::protocol::CommPath;

pub const DEFAULT_PORT: u16 = 44818;

// Encapsulation commands
const CMD_REGISTER_SESSION: u16 = 0x0065;
const CMD_UNREGISTER_SESSION: u16 = 0x0066;
const CMD_SEND_RR_DATA: u16 = 0x006F;
const CMD_SEND_UNIT_DATA: u16 = 0x0070;

const ENCAP_HEADER_SIZE: usize = 24;

// Common packet format items
const ITEM_NULL_ADDRESS: u16 = 0x0000;
const ITEM_CONNECTED_ADDRESS: u16 = 0x00A1;
const ITEM_CONNECTED_DATA: u16 = 0x00B1;
const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

// Connection manager services
const SVC_UNCONNECTED_SEND: u8 = 0x52;
const SVC_FORWARD_OPEN: u8 = 0x54;
const SVC_LARGE_FORWARD_OPEN: u8 = 0x5B;
const SVC_FORWARD_CLOSE: u8 = 0x4E;
const REPLY_FLAG: u8 = 0x80;

const CONNECTION_MANAGER_PATH: [u8; 4] = [0x20, 0x06, 0x24, 0x01];
const MESSAGE_ROUTER_PATH: [u8; 4] = [0x20, 0x02, 0x24, 0x01];

const PRIORITY_TICK_TIME: u8 = 0x0A;
const TIMEOUT_TICKS: u8 = 0x0E;
const ORIGINATOR_VENDOR_ID: u16 = 0x1337;
const ORIGINATOR_SERIAL: u32 = 0x4D45_5846;
const TIMEOUT_MULTIPLIER: u8 = 0x03;
const RPI_MICROS: u32 = 2_000_000;
const TRANSPORT_CLASS_3: u8 = 0xA3;
/// Connection size of a standard Forward Open (routed paths).
const STANDARD_CONNECTION_SIZE: u16 = 504;
/// Connection size of a Large Forward Open (direct paths).
const LARGE_CONNECTION_SIZE: u32 = 4002;

/// Encodes the logical path and data of one CIP request.
pub fn encode_request(request: &CipRequest<'_>) -> Vec<u8> {
    let mut path = Vec::with_capacity(12);
    logical_segment(&mut path, 0x20, request.class);
    logical_segment(&mut path, 0x24, request.instance);
    if let Some(attribute) = request.attribute {
        logical_segment(&mut path, 0x30, attribute);
    }
    let mut buf = Vec::with_capacity(2 + path.len() + request.data.len());
    buf.push(request.service);
    buf.push((path.len() / 2) as u8);
    buf.extend_from_slice(&path);
    buf.extend_from_slice(request.data);
    buf
}

fn logical_segment(buf: &mut Vec<u8>, kind: u8, value: u16) {
    if value <= 0xFF {
        buf.push(kind);
        buf.push(value as u8);
    } else {
        buf.push(kind | 0x01);
        buf.push(0);
        buf.write_u16::<LittleEndian>(value).unwrap();
    }
}

/// Wraps a request in Unconnected Send addressed through `route`.
pub fn unconnected_send(cip: &[u8], route: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(cip.len() + route.len() + 12);
    buf.push(SVC_UNCONNECTED_SEND);
    buf.push((CONNECTION_MANAGER_PATH.len() / 2) as u8);
    buf.extend_from_slice(&CONNECTION_MANAGER_PATH);
    buf.push(PRIORITY_TICK_TIME);
    buf.push(TIMEOUT_TICKS);
    buf.write_u16::<LittleEndian>(cip.len() as u16).unwrap();
    buf.extend_from_slice(cip);
    if cip.len() % 2 != 0 {
        buf.push(0);
    }
    buf.push((route.len() / 2) as u8);
    buf.push(0);
    buf.extend_from_slice(route);
    buf
}

/// Builds an encapsulation frame.
pub fn encapsulate(command: u16, session: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENCAP_HEADER_SIZE + data.len());
    buf.write_u16::<LittleEndian>(command).unwrap();
    buf.write_u16::<LittleEndian>(data.len() as u16).unwrap();
    buf.write_u32::<LittleEndian>(session).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap(); // status
    buf.extend_from_slice(b"mexfer\0\0"); // sender context
    buf.write_u32::<LittleEndian>(0).unwrap(); // options
    buf.extend_from_slice(data);
    buf
}

/// Common packet format body.
fn cpf(items: &[(u16, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(0).unwrap(); // interface handle
    buf.write_u16::<LittleEndian>(0).unwrap(); // timeout
    buf.write_u16::<LittleEndian>(items.len() as u16).unwrap();
    for &(kind, data) in items {
        buf.write_u16::<LittleEndian>(kind).unwrap();
        buf.write_u16::<LittleEndian>(data.len() as u16).unwrap();
        buf.extend_from_slice(data);
    }
    buf
}

/// Finds an item of the given type in a common packet format body.
fn cpf_item(data: &[u8], wanted: u16) -> Result<Vec<u8>, TransportError> {
    let mut cursor = Cursor::new(data);
    let _interface = cursor.read_u32::<LittleEndian>()?;
    let _timeout = cursor.read_u16::<LittleEndian>()?;
    let count = cursor.read_u16::<LittleEndian>()?;
    for _ in 0..count {
        let kind = cursor.read_u16::<LittleEndian>()?;
        let len = cursor.read_u16::<LittleEndian>()? as usize;
        let mut item = vec![0; len];
        cursor.read_exact(&mut item)?;
        if kind == wanted {
            return Ok(item);
        }
    }
    Err(TransportError::Encapsulation(format!(
        "reply has no item 0x{:04X}",
        wanted
    )))
}

/// Checks a CIP reply and returns the data after the status.
pub fn parse_reply(service: u8, reply: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut cursor = Cursor::new(reply);
    let reply_service = cursor.read_u8()?;
    if reply_service != service | REPLY_FLAG {
        return Err(TransportError::Encapsulation(format!(
            "reply service 0x{:02X} does not answer 0x{:02X}",
            reply_service, service
        )));
    }
    let _reserved = cursor.read_u8()?;
    let general = cursor.read_u8()?;
    let extended_words = cursor.read_u8()?;
    let mut extended = Vec::with_capacity(extended_words as usize);
    for _ in 0..extended_words {
        extended.push(cursor.read_u16::<LittleEndian>()?);
    }
    if general != 0 {
        return Err(TransportError::CipStatus {
            service,
            general,
            extended,
        });
    }
    let start = cursor.position() as usize;
    Ok(reply[start..].to_vec())
}

fn map_io(e: io::Error, timeout: Duration) -> TransportError {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => TransportError::Disconnected(e.to_string()),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        _ => TransportError::Io(e),
    }
}

#[derive(Debug, Clone, Copy)]
struct Connection {
    o_t_id: u32,
    serial: u16,
    sequence: u16,
}

/// Blocking EtherNet/IP client for one terminal.
pub struct EnipTransport {
    path: CommPath,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    session: u32,
    connection: Option<Connection>,
    next_serial: u16,
}

impl EnipTransport {
    pub fn new(path: CommPath, port: u16, timeout: Duration) -> Self {
        Self {
            path,
            port,
            timeout,
            stream: None,
            session: 0,
            connection: None,
            next_serial: 1,
        }
    }

    fn exchange(&mut self, command: u16, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let frame = encapsulate(command, self.session, data);
        stream.write_all(&frame).map_err(|e| map_io(e, timeout))?;
        if command == CMD_UNREGISTER_SESSION {
            return Ok(Vec::new());
        }

        let mut header = [0u8; ENCAP_HEADER_SIZE];
        stream.read_exact(&mut header).map_err(|e| map_io(e, timeout))?;
        let mut cursor = Cursor::new(&header[..]);
        let reply_command = cursor.read_u16::<LittleEndian>()?;
        let len = cursor.read_u16::<LittleEndian>()? as usize;
        let session = cursor.read_u32::<LittleEndian>()?;
        let status = cursor.read_u32::<LittleEndian>()?;
        let mut body = vec![0; len];
        stream.read_exact(&mut body).map_err(|e| map_io(e, timeout))?;

        if reply_command != command {
            return Err(TransportError::Encapsulation(format!(
                "reply command 0x{:04X} to 0x{:04X}",
                reply_command, command
            )));
        }
        if status != 0 {
            return Err(TransportError::Encapsulation(format!(
                "encapsulation status 0x{:08X}",
                status
            )));
        }
        if command == CMD_REGISTER_SESSION {
            self.session = session;
        }
        Ok(body)
    }

    fn register_session(&mut self) -> Result<(), TransportError> {
        let mut data = Vec::with_capacity(4);
        data.write_u16::<LittleEndian>(1).unwrap(); // protocol version
        data.write_u16::<LittleEndian>(0).unwrap(); // options
        self.exchange(CMD_REGISTER_SESSION, &data)?;
        debug!(session = %format!("0x{:08X}", self.session), "Session registered");
        Ok(())
    }

    fn send_rr_data(&mut self, service: u8, cip: &[u8]) -> Result<Vec<u8>, TransportError> {
        let body = cpf(&[(ITEM_NULL_ADDRESS, &[][..]), (ITEM_UNCONNECTED_DATA, cip)]);
        let reply = self.exchange(CMD_SEND_RR_DATA, &body)?;
        parse_reply(service, &cpf_item(&reply, ITEM_UNCONNECTED_DATA)?)
    }

    /// Sends an unconnected message, routing it when the path has a route.
    fn unconnected(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        let cip = encode_request(request);
        if self.path.is_routed() {
            let route = self.path.port_segments()?;
            let wrapped = unconnected_send(&cip, &route);
            // Routed replies come back unwrapped from the target.
            let body = cpf(&[
                (ITEM_NULL_ADDRESS, &[][..]),
                (ITEM_UNCONNECTED_DATA, wrapped.as_slice()),
            ]);
            let reply = self.exchange(CMD_SEND_RR_DATA, &body)?;
            let item = cpf_item(&reply, ITEM_UNCONNECTED_DATA)?;
            if item.first() == Some(&(SVC_UNCONNECTED_SEND | REPLY_FLAG)) {
                return parse_reply(SVC_UNCONNECTED_SEND, &item).map(|_| Vec::new());
            }
            return parse_reply(request.service, &item);
        }
        self.send_rr_data(request.service, &cip)
    }

    fn forward_open(&mut self) -> Result<(), TransportError> {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        let large = !self.path.is_routed();
        let service = if large {
            SVC_LARGE_FORWARD_OPEN
        } else {
            SVC_FORWARD_OPEN
        };

        let mut conn_path = self.path.port_segments()?;
        conn_path.extend_from_slice(&MESSAGE_ROUTER_PATH);

        let mut buf = Vec::with_capacity(64);
        buf.push(service);
        buf.push((CONNECTION_MANAGER_PATH.len() / 2) as u8);
        buf.extend_from_slice(&CONNECTION_MANAGER_PATH);
        buf.push(PRIORITY_TICK_TIME);
        buf.push(TIMEOUT_TICKS);
        buf.write_u32::<LittleEndian>(0).unwrap(); // O->T id, chosen by target
        buf.write_u32::<LittleEndian>(0x4D58_0000 | serial as u32).unwrap(); // T->O id
        buf.write_u16::<LittleEndian>(serial).unwrap();
        buf.write_u16::<LittleEndian>(ORIGINATOR_VENDOR_ID).unwrap();
        buf.write_u32::<LittleEndian>(ORIGINATOR_SERIAL).unwrap();
        buf.push(TIMEOUT_MULTIPLIER);
        buf.extend_from_slice(&[0, 0, 0]);
        for _ in 0..2 {
            buf.write_u32::<LittleEndian>(RPI_MICROS).unwrap();
            if large {
                buf.write_u32::<LittleEndian>(0x4200_0000 | LARGE_CONNECTION_SIZE)
                    .unwrap();
            } else {
                buf.write_u16::<LittleEndian>(0x4200 | STANDARD_CONNECTION_SIZE)
                    .unwrap();
            }
        }
        buf.push(TRANSPORT_CLASS_3);
        buf.push((conn_path.len() / 2) as u8);
        buf.extend_from_slice(&conn_path);

        let reply = self.send_rr_data(service, &buf)?;
        let mut cursor = Cursor::new(&reply[..]);
        let o_t_id = cursor.read_u32::<LittleEndian>()?;
        self.connection = Some(Connection {
            o_t_id,
            serial,
            sequence: 0,
        });
        info!(
            connection = %format!("0x{:08X}", o_t_id),
            large, "Forward Open accepted"
        );
        Ok(())
    }

    fn forward_close(&mut self, connection: Connection) -> Result<(), TransportError> {
        let mut conn_path = self.path.port_segments()?;
        conn_path.extend_from_slice(&MESSAGE_ROUTER_PATH);
        let mut buf = Vec::with_capacity(32);
        buf.push(SVC_FORWARD_CLOSE);
        buf.push((CONNECTION_MANAGER_PATH.len() / 2) as u8);
        buf.extend_from_slice(&CONNECTION_MANAGER_PATH);
        buf.push(PRIORITY_TICK_TIME);
        buf.push(TIMEOUT_TICKS);
        buf.write_u16::<LittleEndian>(connection.serial).unwrap();
        buf.write_u16::<LittleEndian>(ORIGINATOR_VENDOR_ID).unwrap();
        buf.write_u32::<LittleEndian>(ORIGINATOR_SERIAL).unwrap();
        buf.push((conn_path.len() / 2) as u8);
        buf.push(0);
        buf.extend_from_slice(&conn_path);
        self.send_rr_data(SVC_FORWARD_CLOSE, &buf)?;
        Ok(())
    }

    fn connected(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        let connection = self.connection.as_mut().ok_or(TransportError::NotOpen)?;
        connection.sequence = connection.sequence.wrapping_add(1);
        let (o_t_id, sequence) = (connection.o_t_id, connection.sequence);

        let mut data = Vec::with_capacity(2 + request.data.len() + 8);
        data.write_u16::<LittleEndian>(sequence).unwrap();
        data.extend_from_slice(&encode_request(request));
        let body = cpf(&[
            (ITEM_CONNECTED_ADDRESS, &o_t_id.to_le_bytes()[..]),
            (ITEM_CONNECTED_DATA, data.as_slice()),
        ]);
        let reply = self.exchange(CMD_SEND_UNIT_DATA, &body)?;
        let item = cpf_item(&reply, ITEM_CONNECTED_DATA)?;
        if item.len() < 2 {
            return Err(TransportError::Encapsulation("connected reply too short".into()));
        }
        parse_reply(request.service, &item[2..])
    }
}

impl CipTransport for EnipTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.is_open() {
            self.close()?;
        }
        let target = format!("{}:{}", self.path.host, self.port);
        let connect_failed = |message: String| TransportError::ConnectFailed {
            path: self.path.to_string(),
            message,
        };
        let addr = target
            .to_socket_addrs()
            .map_err(|e| connect_failed(e.to_string()))?
            .next()
            .ok_or_else(|| connect_failed("no address".to_string()))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| connect_failed(e.to_string()))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        self.register_session()?;
        self.forward_open()?;
        info!(path = %self.path, "EtherNet/IP session open");
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = self.forward_close(connection) {
                warn!(error = %e, "Forward Close failed");
            }
        }
        if self.stream.is_some() {
            if let Err(e) = self.exchange(CMD_UNREGISTER_SESSION, &[]) {
                debug!(error = %e, "UnRegister Session failed");
            }
        }
        self.stream = None;
        self.session = 0;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn generic_message(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        let result = match request.mode {
            MessageMode::Connected => self.connected(request),
            MessageMode::Unconnected => self.unconnected(request),
        };
        if let Err(e) = &result {
            if e.is_disconnect() {
                self.connection = None;
                self.stream = None;
            }
        }
        result
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.timeout = timeout;
        if let Some(stream) = &self.stream {
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
        }
        Ok(())
    }

    fn path(&self) -> &CommPath {
        &self.path
    }
}

impl Drop for EnipTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
