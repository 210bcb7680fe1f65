mod common;

use common::{payload, Harness};
use imagekeep_cache::{CacheConfig, Units};
use imagekeep_core::{ControllerEvent, ImageProps, Size};

fn ram_harness(ram_budget: u64) -> Harness {
    Harness::new(CacheConfig::new(ram_budget, 1_000_000_000, Units::Byte))
}

#[test]
fn overflow_evicts_oldest_unlocked_image() {
    let mut harness = ram_harness(1_000_000);
    let props = ImageProps::default();

    harness.controller.get_image("a", &props);
    harness.deliver("a", payload(1, 1, 600_000));
    assert_eq!(harness.controller.ram().used_bytes(), 600_000);
    assert!(harness.overflows().is_empty());

    harness.controller.get_image("b", &props);
    harness.deliver("b", payload(1, 1, 600_000));

    assert_eq!(harness.controller.ram().used_bytes(), 600_000);
    assert!(!harness.controller.contains("a"));
    assert!(harness.controller.contains("b"));
    assert!(harness.overflows().is_empty());
    assert!(harness
        .events
        .borrow()
        .contains(&ControllerEvent::ImageRemoved {
            url: "a".to_string()
        }));
    assert_eq!(harness.controller.stats().images_evicted, 1);
}

#[test]
fn locked_bucket_protects_its_image() {
    let mut harness = ram_harness(1_000_000);
    let bucket = harness.controller.create_bucket("pinned");
    harness.controller.set_locked(bucket, true).unwrap();
    harness
        .controller
        .create_request(bucket, "c", Size::new(1, 1), &ImageProps::default())
        .unwrap();
    harness.deliver("c", payload(1, 1, 500_000));

    assert!(harness.controller.is_image_locked("c"));
    assert!(!harness.controller.evict_ram(1));
    assert!(!harness.controller.evict_ram(10_000_000));

    assert!(harness.controller.contains("c"));
    assert_eq!(harness.controller.ram().used_bytes(), 500_000);
    assert_eq!(harness.controller.image("c").unwrap().bytes_ram(), 500_000);
}

#[test]
fn unrecoverable_overflow_is_signalled() {
    let mut harness = ram_harness(1_000_000);
    let bucket = harness.controller.create_bucket("pinned");
    harness.controller.set_locked(bucket, true).unwrap();
    harness
        .controller
        .create_request(bucket, "c", Size::new(1, 1), &ImageProps::default())
        .unwrap();

    harness.deliver("c", payload(1, 1, 1_200_000));

    // Charge-then-report: the bytes stay committed
    assert_eq!(harness.controller.ram().used_bytes(), 1_200_000);
    assert_eq!(
        harness.overflows(),
        vec![ControllerEvent::RamOverflow { bytes: 200_000 }]
    );
    assert_eq!(harness.controller.stats().ram_overflows, 1);
}

#[test]
fn partial_recovery_reports_remainder() {
    let mut harness = ram_harness(1_000_000);
    let props = ImageProps::default();
    harness.controller.get_image("small", &props);
    harness.deliver("small", payload(1, 1, 100_000));

    let bucket = harness.controller.create_bucket("pinned");
    harness.controller.set_locked(bucket, true).unwrap();
    harness
        .controller
        .create_request(bucket, "big", Size::new(1, 1), &props)
        .unwrap();
    harness.deliver("big", payload(1, 1, 1_300_000));

    // Overflow 400_000; only "small" (100_000) was evictable
    assert!(!harness.controller.contains("small"));
    assert_eq!(harness.controller.ram().used_bytes(), 1_300_000);
    assert_eq!(
        harness.overflows(),
        vec![ControllerEvent::RamOverflow { bytes: 300_000 }]
    );
}

#[test]
fn evict_ram_stops_once_satisfied() {
    let mut harness = ram_harness(10_000_000);
    let props = ImageProps::default();
    for url in ["a", "b", "c"] {
        harness.controller.get_image(url, &props);
        harness.deliver(url, payload(1, 1, 100_000));
    }

    assert!(harness.controller.evict_ram(150_000));

    let remaining: Vec<&str> = harness.controller.urls().collect();
    assert_eq!(remaining, vec!["c"]);
    assert_eq!(harness.controller.ram().used_bytes(), 100_000);
}

#[test]
fn failed_eviction_leaves_only_locked_images() {
    let mut harness = ram_harness(10_000_000);
    let props = ImageProps::default();
    let pinned = harness.controller.create_bucket("pinned");
    harness.controller.set_locked(pinned, true).unwrap();

    harness.controller.get_image("loose", &props);
    harness.deliver("loose", payload(1, 1, 1_000));
    harness
        .controller
        .create_request(pinned, "kept", Size::new(1, 1), &props)
        .unwrap();
    harness.deliver("kept", payload(1, 1, 1_000));

    assert!(!harness.controller.evict_ram(5_000));

    let remaining: Vec<&str> = harness.controller.urls().collect();
    assert_eq!(remaining, vec!["kept"]);
    assert!(harness
        .controller
        .urls()
        .all(|url| harness.controller.is_image_locked(url)));
}

#[test]
fn decode_charges_uncompressed_bytes() {
    let mut harness = ram_harness(10_000_000);
    harness.controller.get_image("a", &ImageProps::default());
    harness.deliver("a", payload(100, 100, 1_000));
    assert_eq!(harness.controller.ram().used_bytes(), 1_000);

    harness.settle();

    // 100x100 RGBA
    assert_eq!(harness.controller.ram().used_bytes(), 41_000);
    let image = harness.controller.image("a").unwrap();
    assert!(image.got_size());
    assert_eq!(image.bytes_ram(), 41_000);
}

#[test]
fn unlocking_makes_images_evictable() {
    let mut harness = ram_harness(10_000_000);
    let bucket = harness.controller.create_bucket("pinned");
    harness.controller.set_locked(bucket, true).unwrap();
    harness
        .controller
        .create_request(bucket, "c", Size::new(1, 1), &ImageProps::default())
        .unwrap();
    harness.deliver("c", payload(1, 1, 500));
    assert!(!harness.controller.evict_ram(1));

    harness.controller.set_locked(bucket, false).unwrap();
    assert!(harness.controller.evict_ram(1));

    assert!(harness.controller.is_empty());
    assert_eq!(harness.controller.ram().used_bytes(), 0);
    assert!(harness.controller.bucket(bucket).unwrap().is_empty());
}
