// Calflow - Tank Level Example
//
// This example walks one tank through the derivation pipeline: a
// calibration record, a few raw payloads as a device would send them, and
// the derived readings every consumer sees.

use calflow::{
    derive, payload, CalibrationRecord, CalibrationStore, FieldKind, LinearMapping,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Calflow Tank Level Example ===\n");

    // 10-bit ultrasonic level sensor on a 5000 L tank, flow meter in L/h
    let store = CalibrationStore::new();
    store.upsert(
        CalibrationRecord::new("tank-01")
            .with_mapping(FieldKind::Level, LinearMapping::new(0.0, 1023.0, 0.0, 100.0))
            .with_mapping(FieldKind::Flow, LinearMapping::new(0.0, 4095.0, 0.0, 500.0))
            .with_capacity(5000.0)
            .with_thresholds(15.0, 30.0)
            .with_category("diesel")
            .with_revision(1),
    )?;
    println!("Calibration store version: {}\n", store.version());

    let payloads = [
        r#"{"device_id":"tank-01","timestamp":1700000000000,"levelRaw":512,"flowRaw":410}"#,
        r#"{"device_id":"tank-01","timestamp":1700000060000,"levelRaw":280,"flowRaw":410}"#,
        r#"{"device_id":"tank-01","timestamp":1700000120000,"levelRaw":120,"flowRaw":0}"#,
        r#"{"device_id":"tank-01","timestamp":1700000180000,"levelRaw":1100}"#,
    ];

    for json in payloads {
        let raw = payload::parse_json(json)?;
        let calibration = store.require(&raw.device_id)?;
        let reading = derive(&raw, &calibration)?;

        println!("Raw level {:>6}:", raw.field(FieldKind::Level).unwrap_or(f64::NAN));
        println!("  level:           {:.2} %", reading.level().unwrap_or(f64::NAN));
        if let Some(flow) = reading.value(FieldKind::Flow) {
            println!("  flow:            {:.1} L/h", flow);
        }
        println!("  status:          {}", reading.status);
        if let Some(volume) = reading.metrics.remaining_volume {
            println!("  remaining:       {:.1} L", volume);
        }
        match reading.metrics.hours_to_empty {
            Some(hours) => println!("  hours to empty:  {:.1}", hours),
            None => println!("  hours to empty:  n/a"),
        }
        if reading.clamped {
            println!("  (clamped to the calibrated range)");
        }
        println!();
    }

    // Payloads that never reach the engine
    println!("Rejected payloads:");
    for json in [
        r#"{"timestamp":1,"levelRaw":5}"#,
        r#"{"device_id":"tank-01","timestamp":1,"levelRaw":"full"}"#,
        r#"{"device_id":"tank-01","timestamp":1,"colour":3}"#,
    ] {
        if let Err(e) = payload::parse_json(json) {
            println!("  {}", e);
        }
    }

    // Unknown device
    let raw = payload::parse_json(r#"{"device_id":"tank-99","timestamp":1,"levelRaw":5}"#)?;
    if let Err(e) = store.require(&raw.device_id) {
        println!("  {}", e);
    }

    Ok(())
}
