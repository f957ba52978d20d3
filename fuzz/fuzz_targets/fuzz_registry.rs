#![no_main]

use libfuzzer_sys::fuzz_target;
use peerlink::serialization::Registry;
use peerlink::wire_composite;

#[derive(Debug, Default)]
struct Record {
    id: u32,
    name: String,
    values: Vec<i64>,
    children: Vec<Vec<String>>,
    active: bool,
}
wire_composite!(Record {
    id: u32,
    name: String,
    values: Vec<i64>,
    children: Vec<Vec<String>>,
    active: bool,
});

fuzz_target!(|data: &[u8]| {
    // Hostile lengths and counts must fail cleanly
    let registry = Registry::new();
    if registry.register_composite::<Record>().is_ok() {
        let _ = registry.deserialize::<Record>(data);
    }
    let _ = registry.deserialize::<Vec<String>>(data);
    let _ = registry.deserialize::<String>(data);
});
