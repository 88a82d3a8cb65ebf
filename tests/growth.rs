use layermap::LayeredHashMap;

#[test]
fn filling_the_first_stratum_grows_a_second() {
    let map = LayeredHashMap::<u64, u64>::new().unwrap();
    let p0 = map.capacity() as u64;

    for i in 0..=p0 {
        map.write(i, i);
    }

    assert!(
        map.capacity() as u64 > p0,
        "no stratum was appended after {} inserts",
        p0 + 1
    );
    assert_eq!(map.size(), p0 + 1);
    for i in 0..=p0 {
        assert_eq!(map.read(&i), Ok(i), "key {} lost after growth", i);
    }
}

#[test]
fn growth_keeps_scattered_hashes_readable() {
    let map = LayeredHashMap::<u64, u64>::new().unwrap();
    let count = map.capacity() as u64 + 500;
    // High-entropy keys exercise the relocation paths: many of them change
    // slots when the hash mask widens.
    let key = |i: u64| i.wrapping_mul(0x9e37_79b9_7f4a_7c15);

    for i in 0..count {
        map.write(key(i), i);
    }
    assert_eq!(map.size(), count);
    for i in 0..count {
        assert_eq!(map.read(&key(i)), Ok(i));
    }
}

#[test]
fn with_capacity_preallocates_strata() {
    let map = LayeredHashMap::<u64, u64>::with_capacity(20_000).unwrap();
    assert!(map.capacity() >= 20_000);

    let before = map.capacity();
    for i in 0..1_000u64 {
        map.write(i, i);
    }
    // Nothing close to the capacity was inserted, so no further growth.
    assert_eq!(map.capacity(), before);
    assert_eq!(map.size(), 1_000);
}

#[test]
fn with_capacity_zero_is_the_default_layout() {
    let a = LayeredHashMap::<u64, u64>::new().unwrap();
    let b = LayeredHashMap::<u64, u64>::with_capacity(0).unwrap();
    assert_eq!(a.capacity(), b.capacity());
}

#[test]
fn collisions_survive_growth() {
    let map = LayeredHashMap::<u64, u64>::new().unwrap();
    let p0 = map.capacity() as u64;
    let masked_out = (map.capacity() as u64).next_power_of_two();
    let colliders = [0, p0, masked_out];
    for &k in &colliders {
        map.write(k, k + 1);
    }

    // Push the table over its first stratum; the collision chain must come
    // through the relocation sweep intact.
    for i in 0..=p0 {
        map.write(i + 1_000_000, i);
    }
    assert!(map.capacity() as u64 > p0);

    for &k in &colliders {
        assert_eq!(map.read(&k), Ok(k + 1));
    }
    assert_eq!(map.size(), p0 + 1 + 3);
}

#[test]
fn deletes_after_growth() {
    let map = LayeredHashMap::<u64, u64>::new().unwrap();
    let count = map.capacity() as u64 + 100;
    for i in 0..count {
        map.write(i, i);
    }
    for i in 0..count {
        assert!(map.delete(&i), "key {} not deletable after growth", i);
    }
    assert_eq!(map.size(), 0);
    assert!(map.read(&0).is_err());
}

#[test]
fn dropped_maps_recycle_cleanly() {
    // Churn far more maps than there are instance ids; each reused id must
    // come back with a zeroed size.
    for round in 0..2_000u64 {
        let map = LayeredHashMap::<u64, u64>::new().unwrap();
        assert_eq!(map.size(), 0, "round {} inherited a stale size", round);
        map.write(round, round);
        map.write(round + 1, round);
        assert_eq!(map.size(), 2);
    }
}
