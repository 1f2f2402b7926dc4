//! Demonstrates hand-off between threads via a value slot and its consumers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use value_slot::ValueSlot;

fn main() {
    let slot = Arc::new(ValueSlot::new());

    let observer = slot.consume_all_values(|value: Option<&String>| {
        println!("Observed change: {value:?}");
    });

    let first = slot.consume_value(|value: &String| {
        println!("First value to arrive: {value}");
    });

    let producer = thread::spawn({
        let slot = Arc::clone(&slot);
        move || {
            thread::sleep(Duration::from_millis(50));
            slot.set(Some("hello".to_string()));
            slot.set(Some("world".to_string()));
        }
    });

    let value = slot.wait_for_specific_value(&"world".to_string(), Duration::from_secs(5));
    println!("Saw the final value: {value}");

    producer.join().unwrap();

    assert_eq!(first.wait(), "hello");
    observer.cancel();

    println!("Slot now holds: {slot}");
}
