//! Shared test support: an in-process Modbus TCP device
//!
//! Listens on an ephemeral port and serves FC 01-06/15/16 from in-memory
//! register and coil banks, recording every write. Tests point real
//! devices at it so the full transport/session/poller path is exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::model::{
    AdvancedSettings, DataPoint, Device, Parameter, Parser, RegisterRange, TransportConfig,
};
use crate::scaling::Scaling;
use crate::value::DataType;

/// Handle to a running mock device.
#[derive(Clone)]
pub(crate) struct MockDevice {
    /// `host:port` the mock listens on
    pub addr: String,
    /// Holding/input register bank (absolute address -> value)
    pub registers: Arc<Mutex<HashMap<u16, u16>>>,
    /// Coil/discrete bank
    pub coils: Arc<Mutex<HashMap<u16, bool>>>,
    /// Recorded writes as (function code, address, values)
    pub writes: Arc<Mutex<Vec<(u8, u16, Vec<u16>)>>>,
    /// When set, every request is answered with exception 0x04
    pub fail_requests: Arc<AtomicBool>,
}

impl MockDevice {
    pub fn set_register(&self, address: u16, value: u16) {
        self.registers.lock().unwrap().insert(address, value);
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.coils.lock().unwrap().insert(address, value);
    }

    pub fn recorded_writes(&self) -> Vec<(u8, u16, Vec<u16>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }
}

/// Start a mock device on an ephemeral port.
pub(crate) async fn spawn_mock_device() -> MockDevice {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mock = MockDevice {
        addr,
        registers: Arc::new(Mutex::new(HashMap::new())),
        coils: Arc::new(Mutex::new(HashMap::new())),
        writes: Arc::new(Mutex::new(Vec::new())),
        fail_requests: Arc::new(AtomicBool::new(false)),
    };

    let server = mock.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            let conn = server.clone();
            tokio::spawn(async move { serve_connection(conn, socket).await });
        }
    });

    mock
}

async fn serve_connection(mock: MockDevice, mut socket: TcpStream) {
    loop {
        let mut header = [0u8; 7];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        if socket.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let response_pdu = if mock.fail_requests.load(Ordering::SeqCst) {
            vec![pdu[0] | 0x80, 0x04]
        } else {
            handle_pdu(&mock, &pdu)
        };

        let mut response = Vec::with_capacity(7 + response_pdu.len());
        response.extend_from_slice(&header[0..4]);
        response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        response.push(header[6]);
        response.extend_from_slice(&response_pdu);
        if socket.write_all(&response).await.is_err() {
            return;
        }
    }
}

fn handle_pdu(mock: &MockDevice, pdu: &[u8]) -> Vec<u8> {
    let fc = pdu[0];
    match fc {
        0x01 | 0x02 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
            let coils = mock.coils.lock().unwrap();
            let byte_count = (quantity as usize).div_ceil(8);
            let mut data = vec![0u8; byte_count];
            for i in 0..quantity {
                if coils.get(&(address + i)).copied().unwrap_or(false) {
                    data[i as usize / 8] |= 1 << (i % 8);
                }
            }
            let mut out = vec![fc, byte_count as u8];
            out.extend_from_slice(&data);
            out
        }
        0x03 | 0x04 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
            let registers = mock.registers.lock().unwrap();
            let mut out = vec![fc, (quantity * 2) as u8];
            for i in 0..quantity {
                let value = registers.get(&(address + i)).copied().unwrap_or(0);
                out.extend_from_slice(&value.to_be_bytes());
            }
            out
        }
        0x05 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let on = pdu[3] == 0xFF;
            mock.coils.lock().unwrap().insert(address, on);
            mock.writes
                .lock()
                .unwrap()
                .push((fc, address, vec![u16::from(on)]));
            pdu.to_vec()
        }
        0x06 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let value = u16::from_be_bytes([pdu[3], pdu[4]]);
            mock.registers.lock().unwrap().insert(address, value);
            mock.writes.lock().unwrap().push((fc, address, vec![value]));
            pdu.to_vec()
        }
        0x0F => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
            let mut values = Vec::new();
            {
                let mut coils = mock.coils.lock().unwrap();
                for i in 0..quantity {
                    let byte = pdu[6 + i as usize / 8];
                    let on = (byte >> (i % 8)) & 1 != 0;
                    coils.insert(address + i, on);
                    values.push(u16::from(on));
                }
            }
            mock.writes.lock().unwrap().push((fc, address, values));
            vec![fc, pdu[1], pdu[2], pdu[3], pdu[4]]
        }
        0x10 => {
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
            let mut values = Vec::new();
            {
                let mut registers = mock.registers.lock().unwrap();
                for i in 0..quantity {
                    let offset = 6 + i as usize * 2;
                    let value = u16::from_be_bytes([pdu[offset], pdu[offset + 1]]);
                    registers.insert(address + i, value);
                    values.push(value);
                }
            }
            mock.writes.lock().unwrap().push((fc, address, values));
            vec![fc, pdu[1], pdu[2], pdu[3], pdu[4]]
        }
        _ => vec![fc | 0x80, 0x01],
    }
}

/// Bare parameter with sensible defaults for tests.
pub(crate) fn test_parameter(name: &str, data_type: DataType, register_index: u16) -> Parameter {
    Parameter {
        name: name.into(),
        unit: None,
        description: None,
        data_type,
        register_index,
        word_count: None,
        byte_order: None,
        scaling: Scaling::default(),
        default_value: None,
        bit_position: None,
        function_code: None,
    }
}

/// TCP device pointed at a mock endpoint.
pub(crate) fn test_device(id: &str, addr: &str, data_points: Vec<DataPoint>) -> Device {
    let (host, port) = addr.rsplit_once(':').unwrap();
    Device {
        id: id.into(),
        name: format!("test {id}"),
        make: None,
        enabled: true,
        transport: TransportConfig::Tcp {
            host: host.into(),
            port: port.parse().unwrap(),
            unit_id: 1,
            timeout: Some(500),
        },
        data_points,
        writable_registers: None,
        control_parameters: None,
        advanced: AdvancedSettings {
            retry_interval_ms: 10,
            ..Default::default()
        },
        polling_interval_ms: None,
        last_seen: None,
        last_controlled_at: None,
        active_schedule_id: None,
        extra: serde_json::Map::new(),
    }
}

/// One data point reading `count` registers at `start` with FC03.
pub(crate) fn holding_point(start: u16, count: u16, parameters: Vec<Parameter>) -> DataPoint {
    DataPoint {
        range: RegisterRange {
            function_code: 3,
            start_address: start,
            count,
        },
        parser: Parser { parameters },
    }
}
