//! Watlow F4T chamber controller over Modbus/TCP.
//!
//! Frames are an MBAP header (transaction id, protocol id 0, length, unit id)
//! followed by a PDU. The F4T stores temperatures as IEEE-754 single floats
//! spread across two holding registers; which register carries the low word
//! is configurable.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::{ChamberConfig, RegisterMap, WordOrder};

use super::{ChamberController, ChamberError, ProcessReading};

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const EXCEPTION_FLAG: u8 = 0x80;
const MBAP_LEN: usize = 7;
/// Largest PDU a Modbus/TCP ADU may carry.
const MAX_PDU_LEN: usize = 253;

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction: u16,
    pub protocol: u16,
    /// Byte count of unit id + PDU.
    pub length: u16,
    pub unit: u8,
}

impl MbapHeader {
    pub fn decode(mut raw: &[u8]) -> Result<Self, ChamberError> {
        if raw.len() < MBAP_LEN {
            return Err(ChamberError::Protocol(format!(
                "MBAP header needs {} bytes, got {}",
                MBAP_LEN,
                raw.len()
            )));
        }
        Ok(Self {
            transaction: raw.get_u16(),
            protocol: raw.get_u16(),
            length: raw.get_u16(),
            unit: raw.get_u8(),
        })
    }
}

/// Wrap a PDU in an MBAP header.
pub fn encode_frame(transaction: u16, unit: u8, pdu: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_LEN + pdu.len());
    buf.put_u16(transaction);
    buf.put_u16(0);
    buf.put_u16((pdu.len() + 1) as u16);
    buf.put_u8(unit);
    buf.put_slice(pdu);
    buf.freeze()
}

pub fn read_holding_pdu(address: u16, count: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(READ_HOLDING_REGISTERS);
    buf.put_u16(address);
    buf.put_u16(count);
    buf.freeze()
}

pub fn write_single_pdu(address: u16, value: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(WRITE_SINGLE_REGISTER);
    buf.put_u16(address);
    buf.put_u16(value);
    buf.freeze()
}

pub fn write_multiple_pdu(address: u16, values: &[u16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + values.len() * 2);
    buf.put_u8(WRITE_MULTIPLE_REGISTERS);
    buf.put_u16(address);
    buf.put_u16(values.len() as u16);
    buf.put_u8((values.len() * 2) as u8);
    for v in values {
        buf.put_u16(*v);
    }
    buf.freeze()
}

/// Check the function code of a response PDU and return the bytes after it.
pub fn response_body(expected: u8, mut pdu: Bytes) -> Result<Bytes, ChamberError> {
    if pdu.is_empty() {
        return Err(ChamberError::Protocol("empty response PDU".into()));
    }
    let function = pdu.get_u8();
    if function == expected | EXCEPTION_FLAG {
        let code = if pdu.is_empty() { 0 } else { pdu.get_u8() };
        return Err(ChamberError::Exception {
            function: expected,
            code,
        });
    }
    if function != expected {
        return Err(ChamberError::Protocol(format!(
            "expected function 0x{:02x}, got 0x{:02x}",
            expected, function
        )));
    }
    Ok(pdu)
}

/// Decode the body of a read-holding-registers response.
pub fn decode_registers(mut body: Bytes, expected: u16) -> Result<Vec<u16>, ChamberError> {
    if body.is_empty() {
        return Err(ChamberError::Protocol("missing byte count".into()));
    }
    let byte_count = body.get_u8() as usize;
    if byte_count != expected as usize * 2 || body.len() != byte_count {
        return Err(ChamberError::Protocol(format!(
            "expected {} registers, response carries {} bytes",
            expected,
            body.len()
        )));
    }
    Ok((0..expected).map(|_| body.get_u16()).collect())
}

pub fn f32_to_registers(value: f32, order: WordOrder) -> [u16; 2] {
    let bits = value.to_bits();
    let high = (bits >> 16) as u16;
    let low = bits as u16;
    match order {
        WordOrder::LowFirst => [low, high],
        WordOrder::HighFirst => [high, low],
    }
}

pub fn registers_to_f32(regs: [u16; 2], order: WordOrder) -> f32 {
    let (high, low) = match order {
        WordOrder::LowFirst => (regs[1], regs[0]),
        WordOrder::HighFirst => (regs[0], regs[1]),
    };
    f32::from_bits(((high as u32) << 16) | low as u32)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Modbus/TCP client for a single F4T control loop.
pub struct WatlowF4t {
    stream: TcpStream,
    unit_id: u8,
    transaction: u16,
    io_timeout: Duration,
    word_order: WordOrder,
    registers: RegisterMap,
}

impl WatlowF4t {
    pub async fn connect(config: &ChamberConfig) -> Result<Self, ChamberError> {
        let io_timeout = config.io_timeout();
        let stream = tokio::time::timeout(io_timeout, TcpStream::connect(&config.address))
            .await
            .map_err(|_| ChamberError::Timeout {
                operation: "connect",
                timeout_sec: io_timeout.as_secs(),
            })?
            .map_err(|source| ChamberError::Connect {
                address: config.address.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        info!(address = %config.address, unit_id = config.unit_id, "connected to chamber controller");

        Ok(Self {
            stream,
            unit_id: config.unit_id,
            transaction: 0,
            io_timeout,
            word_order: config.word_order,
            registers: config.registers.clone(),
        })
    }

    /// Send one request PDU and return the matching response PDU.
    async fn transact(&mut self, operation: &'static str, pdu: Bytes) -> Result<Bytes, ChamberError> {
        self.transaction = self.transaction.wrapping_add(1);
        let transaction = self.transaction;
        let frame = encode_frame(transaction, self.unit_id, &pdu);
        let stream = &mut self.stream;

        let exchange = async {
            stream.write_all(&frame).await?;

            let mut raw_header = [0u8; MBAP_LEN];
            stream.read_exact(&mut raw_header).await?;
            let header = MbapHeader::decode(&raw_header)?;

            let pdu_len = (header.length as usize).saturating_sub(1);
            if pdu_len == 0 || pdu_len > MAX_PDU_LEN {
                return Err(ChamberError::Protocol(format!(
                    "invalid MBAP length {}",
                    header.length
                )));
            }
            let mut body = vec![0u8; pdu_len];
            stream.read_exact(&mut body).await?;
            Ok((header, Bytes::from(body)))
        };

        let (header, response) = tokio::time::timeout(self.io_timeout, exchange)
            .await
            .map_err(|_| ChamberError::Timeout {
                operation,
                timeout_sec: self.io_timeout.as_secs(),
            })??;

        if header.transaction != transaction || header.protocol != 0 {
            return Err(ChamberError::Protocol(format!(
                "response for transaction {} (protocol {}) while waiting on {}",
                header.transaction, header.protocol, transaction
            )));
        }

        debug!(operation, transaction, "modbus exchange complete");
        Ok(response)
    }

    async fn read_float(&mut self, operation: &'static str, address: u16) -> Result<f64, ChamberError> {
        let response = self.transact(operation, read_holding_pdu(address, 2)).await?;
        let body = response_body(READ_HOLDING_REGISTERS, response)?;
        let regs = decode_registers(body, 2)?;
        Ok(registers_to_f32([regs[0], regs[1]], self.word_order) as f64)
    }

    async fn write_float(&mut self, operation: &'static str, address: u16, value: f64) -> Result<(), ChamberError> {
        let regs = f32_to_registers(value as f32, self.word_order);
        let response = self
            .transact(operation, write_multiple_pdu(address, &regs))
            .await?;
        let mut body = response_body(WRITE_MULTIPLE_REGISTERS, response)?;
        if body.len() != 4 || body.get_u16() != address || body.get_u16() != 2 {
            return Err(ChamberError::Protocol(
                "write-multiple acknowledgement does not echo the request".into(),
            ));
        }
        Ok(())
    }

    async fn write_register(&mut self, operation: &'static str, address: u16, value: u16) -> Result<(), ChamberError> {
        let response = self
            .transact(operation, write_single_pdu(address, value))
            .await?;
        let mut body = response_body(WRITE_SINGLE_REGISTER, response)?;
        if body.len() != 4 || body.get_u16() != address || body.get_u16() != value {
            return Err(ChamberError::Protocol(
                "write-single acknowledgement does not echo the request".into(),
            ));
        }
        Ok(())
    }

    /// Read back the loop setpoint.
    pub async fn read_setpoint(&mut self) -> Result<f64, ChamberError> {
        self.read_float("read setpoint", self.registers.setpoint).await
    }
}

#[async_trait::async_trait]
impl ChamberController for WatlowF4t {
    async fn set_target(&mut self, value: f64) -> Result<(), ChamberError> {
        debug!(setpoint = value, "writing loop setpoint");
        self.write_float("set target", self.registers.setpoint, value)
            .await
    }

    async fn start_conditioning(&mut self) -> Result<(), ChamberError> {
        let (register, value) = (self.registers.conditioning, self.registers.conditioning_on);
        self.write_register("start conditioning", register, value).await
    }

    async fn stop_conditioning(&mut self) -> Result<(), ChamberError> {
        let (register, value) = (self.registers.conditioning, self.registers.conditioning_off);
        self.write_register("stop conditioning", register, value).await
    }

    async fn sample(&mut self) -> Result<ProcessReading, ChamberError> {
        let air = self
            .read_float("sample process value", self.registers.process_value)
            .await?;
        Ok(ProcessReading { air })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    /// Minimal Modbus/TCP server backed by a register bank.
    async fn serve_registers(listener: TcpListener, mut bank: HashMap<u16, u16>, reject: Option<u8>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        loop {
            let mut raw = [0u8; MBAP_LEN];
            if socket.read_exact(&mut raw).await.is_err() {
                return;
            }
            let header = MbapHeader::decode(&raw).unwrap();
            let mut pdu = vec![0u8; header.length as usize - 1];
            socket.read_exact(&mut pdu).await.unwrap();
            let mut req = Bytes::from(pdu);
            let function = req.get_u8();

            let mut reply = BytesMut::new();
            if Some(function) == reject {
                reply.put_u8(function | EXCEPTION_FLAG);
                reply.put_u8(2);
            } else {
                match function {
                    READ_HOLDING_REGISTERS => {
                        let addr = req.get_u16();
                        let count = req.get_u16();
                        reply.put_u8(function);
                        reply.put_u8((count * 2) as u8);
                        for i in 0..count {
                            reply.put_u16(*bank.get(&(addr + i)).unwrap_or(&0));
                        }
                    }
                    WRITE_SINGLE_REGISTER => {
                        let addr = req.get_u16();
                        let value = req.get_u16();
                        bank.insert(addr, value);
                        reply.put_u8(function);
                        reply.put_u16(addr);
                        reply.put_u16(value);
                    }
                    WRITE_MULTIPLE_REGISTERS => {
                        let addr = req.get_u16();
                        let count = req.get_u16();
                        let _bytes = req.get_u8();
                        for i in 0..count {
                            bank.insert(addr + i, req.get_u16());
                        }
                        reply.put_u8(function);
                        reply.put_u16(addr);
                        reply.put_u16(count);
                    }
                    other => panic!("unexpected function {other}"),
                }
            }
            let frame = encode_frame(header.transaction, header.unit, &reply);
            socket.write_all(&frame).await.unwrap();
        }
    }

    async fn start_server(bank: HashMap<u16, u16>, reject: Option<u8>) -> ChamberConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_registers(listener, bank, reject));
        ChamberConfig {
            address: addr.to_string(),
            io_timeout_sec: 2,
            ..ChamberConfig::default()
        }
    }

    #[test]
    fn test_float_word_order() {
        let low_first = f32_to_registers(30.5, WordOrder::LowFirst);
        let high_first = f32_to_registers(30.5, WordOrder::HighFirst);
        assert_eq!(low_first, [high_first[1], high_first[0]]);
        assert_eq!(registers_to_f32(low_first, WordOrder::LowFirst), 30.5);
        assert_eq!(registers_to_f32(high_first, WordOrder::HighFirst), 30.5);
        // Reading with the wrong order yields a different value.
        assert_ne!(registers_to_f32(low_first, WordOrder::HighFirst), 30.5);
    }

    #[test]
    fn test_encode_read_request() {
        let frame = encode_frame(7, 1, &read_holding_pdu(2820, 2));
        assert_eq!(
            frame.as_ref(),
            &[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x0b, 0x04, 0x00, 0x02]
        );
    }

    #[test]
    fn test_exception_response_is_reported() {
        let pdu = Bytes::from_static(&[0x83, 0x02]);
        match response_body(READ_HOLDING_REGISTERS, pdu) {
            Err(ChamberError::Exception { function, code }) => {
                assert_eq!(function, READ_HOLDING_REGISTERS);
                assert_eq!(code, 2);
            }
            other => panic!("expected exception, got {other:?}"),
        }
    }

    #[test]
    fn test_short_register_payload_rejected() {
        let body = Bytes::from_static(&[0x04, 0x00, 0x01]);
        assert!(matches!(
            decode_registers(body, 2),
            Err(ChamberError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_set_target_and_sample_against_server() {
        let registers = RegisterMap::default();
        let pv = f32_to_registers(29.75, WordOrder::LowFirst);
        let mut bank = HashMap::new();
        bank.insert(registers.process_value, pv[0]);
        bank.insert(registers.process_value + 1, pv[1]);

        let config = start_server(bank, None).await;
        let mut chamber = WatlowF4t::connect(&config).await.unwrap();

        chamber.set_target(30.5).await.unwrap();
        assert_eq!(chamber.read_setpoint().await.unwrap(), 30.5);

        chamber.start_conditioning().await.unwrap();
        chamber.stop_conditioning().await.unwrap();

        let reading = chamber.sample().await.unwrap();
        assert_eq!(reading.air, 29.75);
    }

    #[tokio::test]
    async fn test_controller_exception_surfaces() {
        let config = start_server(HashMap::new(), Some(READ_HOLDING_REGISTERS)).await;
        let mut chamber = WatlowF4t::connect(&config).await.unwrap();

        let err = chamber.sample().await.unwrap_err();
        assert!(matches!(err, ChamberError::Exception { code: 2, .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ChamberConfig {
            address: addr.to_string(),
            io_timeout_sec: 2,
            ..ChamberConfig::default()
        };
        let result = WatlowF4t::connect(&config).await;
        assert!(matches!(result, Err(ChamberError::Connect { .. })));
    }
}
