//! Modgate Demo
//!
//! Walks through the gateway building blocks:
//! - register decoding with byte orders and the scaling pipeline
//! - RTU framing and CRC-16
//! - schedule rule evaluation
//! - a full poll cycle against a live Modbus TCP endpoint (optional)
//!
//! Usage: cargo run --bin demo [server_address]
//! Example: cargo run --bin demo 127.0.0.1:502

use std::sync::Arc;

use chrono::Weekday;
use modgate::model::{
    ClockTime, DataPoint, DaySpec, DeviceSchedule, Parameter, Parser, RegisterRange, ScheduleRule,
};
use modgate::repository::{MemoryDeviceRepository, MemoryHistorySink, MemoryPushChannel};
use modgate::schedule::evaluate_schedule;
use modgate::{ByteOrder, CoreState, DataType, Poller, Scaling};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🏭 Modgate v{} Demo", modgate::VERSION);
    println!("====================\n");

    // =========================================================================
    // Part 1: Register decoding with byte orders
    // =========================================================================
    println!("📦 Part 1: Register Decoding");
    println!("----------------------------");

    // 3.14 as FLOAT32 is 0x4048F5C3.
    let network_order = [0x4048u16, 0xF5C3];
    let word_swapped = [0xF5C3u16, 0x4048];
    for (label, regs, order) in [
        ("ABCD", &network_order, ByteOrder::Abcd),
        ("CDAB", &word_swapped, ByteOrder::Cdab),
    ] {
        let value = modgate::decode_value(regs, DataType::Float32, order, 0)?;
        println!("  [{:04X} {:04X}] as {label} -> {value}", regs[0], regs[1]);
    }

    // =========================================================================
    // Part 2: Scaling pipeline
    // =========================================================================
    println!("\n📊 Part 2: Scaling Pipeline");
    println!("---------------------------");

    let scaling = Scaling {
        scaling_factor: Some(0.1),
        scaling_equation: Some("x + 2".into()),
        decimal_point: Some(1),
        min_value: Some(0.0),
        max_value: Some(100.0),
    };
    for raw in [215.0, 990.0, 1200.0] {
        let scaled = modgate::scaling::apply(raw, &scaling);
        println!("  raw {raw} -> {scaled:?}");
    }

    // =========================================================================
    // Part 3: RTU framing
    // =========================================================================
    println!("\n🔗 Part 3: RTU Framing");
    println!("----------------------");

    let pdu = modgate::PduBuilder::read_request(0x03, 0, 1)?;
    let frame = modgate::frame::encode_rtu_frame(0x01, &pdu);
    let hex: Vec<String> = frame.iter().map(|b| format!("{b:02X}")).collect();
    println!("  FC03 read of 1 register @ 0, unit 1: {}", hex.join(" "));
    println!("  CRC valid: {}", modgate::verify_crc(&frame));

    // =========================================================================
    // Part 4: Schedule rule evaluation
    // =========================================================================
    println!("\n🕐 Part 4: Schedule Rules");
    println!("-------------------------");

    let rule = ScheduleRule {
        id: "office-hours".into(),
        enabled: true,
        days: vec![DaySpec::Weekday],
        start_time: "08:00".parse::<ClockTime>()?,
        end_time: "18:00".parse::<ClockTime>()?,
        setpoint: 22.0,
        default_setpoint: Some(28.0),
        return_to_default: true,
        parameter: "setpoint".into(),
        register_address: None,
    };
    let schedule = DeviceSchedule {
        id: "s1".into(),
        device_id: "hvac-1".into(),
        template_id: "t1".into(),
        custom_rules: Vec::new(),
        active: true,
        start_date: None,
        end_date: None,
        current_active_rule: None,
        last_applied: None,
        extra: serde_json::Map::new(),
    };

    for (label, minute) in [("08:00", 480u16), ("12:00", 720), ("18:00", 1080), ("20:00", 1200)] {
        let fired = evaluate_schedule(&schedule, std::slice::from_ref(&rule), Weekday::Tue, minute);
        match fired.first() {
            Some((_, action)) => println!("  Tuesday {label} -> {action:?}"),
            None => println!("  Tuesday {label} -> (quiet)"),
        }
    }

    // =========================================================================
    // Part 5: Poll cycle against a live endpoint
    // =========================================================================
    println!("\n🔌 Part 5: Poll Cycle");
    println!("---------------------");

    let server_address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:502".to_string());
    let (host, port) = server_address
        .rsplit_once(':')
        .unwrap_or((server_address.as_str(), "502"));

    let temperature = Parameter {
        name: "temperature".into(),
        unit: Some("C".into()),
        description: None,
        data_type: DataType::Uint16,
        register_index: 0,
        word_count: None,
        byte_order: None,
        scaling: Scaling {
            scaling_factor: Some(0.1),
            ..Default::default()
        },
        default_value: None,
        bit_position: None,
        function_code: None,
    };

    let device = modgate::Device {
        id: "demo-meter".into(),
        name: "Demo meter".into(),
        make: None,
        enabled: true,
        transport: modgate::TransportConfig::Tcp {
            host: host.into(),
            port: port.parse().unwrap_or(502),
            unit_id: 1,
            timeout: Some(2000),
        },
        data_points: vec![DataPoint {
            range: RegisterRange {
                function_code: 3,
                start_address: 0,
                count: 2,
            },
            parser: Parser {
                parameters: vec![temperature],
            },
        }],
        writable_registers: None,
        control_parameters: None,
        advanced: Default::default(),
        polling_interval_ms: None,
        last_seen: None,
        last_controlled_at: None,
        active_schedule_id: None,
        extra: serde_json::Map::new(),
    };

    let state = CoreState::init();
    let devices = Arc::new(MemoryDeviceRepository::new());
    devices.upsert(device)?;
    let poller = Poller::new(
        Arc::clone(&state),
        devices,
        Arc::new(MemoryHistorySink::new()),
        Arc::new(MemoryPushChannel::new()),
    );

    println!("  Polling {server_address}...");
    match poller.poll_device("demo-meter").await {
        Ok(reading) => {
            for entry in &reading.entries {
                match (&entry.value, &entry.error) {
                    (Some(value), _) => println!(
                        "    {} = {value} {}",
                        entry.name,
                        entry.unit.as_deref().unwrap_or("")
                    ),
                    (None, Some(error)) => println!("    {} errored: {error}", entry.name),
                    _ => {}
                }
            }
        }
        Err(e) => {
            println!("  ⚠️  Poll failed: {e}");
            println!("  (Expected when no Modbus server is listening there)");
        }
    }

    state.shutdown().await;
    println!("\n🎉 Demo completed!");
    Ok(())
}
