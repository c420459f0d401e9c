//! Cache behaviour across threads, cache instances and simulated crashes.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use regrid_core::cache::EntryKind;
use regrid_core::{GridTarget, MaskVariant, Method, RegridError, WeightGenerator};
use test_utils::{grids, SyntheticGenerator, TestRegridder};

fn atmos() -> GridTarget {
    GridTarget::parse(grids::ATMOS)
}

#[test]
fn test_concurrent_callers_share_one_computation() {
    let fixture =
        TestRegridder::with_generator(SyntheticGenerator::new().with_delay(Duration::from_millis(200)));
    // Two more cache instances on the same root stand in for other processes.
    let others = [fixture.reopen(), fixture.reopen()];

    let results: Vec<_> = thread::scope(|s| {
        let mut handles = Vec::new();
        for _ in 0..6 {
            let regridder = fixture.regridder.clone();
            handles.push(s.spawn(move || {
                regridder.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
            }));
        }
        for other in &others {
            for _ in 0..3 {
                handles.push(s.spawn(move || {
                    other.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
                }));
            }
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(fixture.generator.calls(), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        let artifact = result.as_ref().unwrap();
        assert_eq!(artifact.weights, first.weights);
    }

    let weights: Vec<_> = fixture
        .cache()
        .list()
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Weights)
        .collect();
    assert_eq!(weights.len(), 1);
    assert_eq!(fs::read_dir(fixture.dir.path().join("tmp")).unwrap().count(), 0);
}

#[test]
fn test_masked_and_unmasked_use_distinct_entries() {
    let fixture = TestRegridder::new();
    let r = &fixture.regridder;

    let unmasked = r
        .request(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked, None)
        .unwrap();
    let masked = r
        .request(grids::OCEAN, &atmos(), None, MaskVariant::Masked, None)
        .unwrap();
    let cache = fixture.cache();
    assert_ne!(cache.key_for(&unmasked), cache.key_for(&masked));

    r.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked).unwrap();
    r.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Masked).unwrap();
    r.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Masked).unwrap();
    assert_eq!(fixture.generator.calls(), 2);

    let variants: Vec<MaskVariant> = cache
        .list()
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Weights)
        .filter_map(|e| e.meta.and_then(|m| m.mask_variant))
        .collect();
    assert_eq!(variants.len(), 2);
    assert!(variants.contains(&MaskVariant::Masked));
    assert!(variants.contains(&MaskVariant::Unmasked));
}

#[test]
fn test_method_and_generator_version_are_part_of_the_key() {
    let fixture = TestRegridder::new();
    fixture
        .regridder
        .weights_for(grids::OCEAN, &atmos(), Some(Method::Nearest), MaskVariant::Unmasked)
        .unwrap();
    fixture
        .regridder
        .weights_for(grids::OCEAN, &atmos(), Some(Method::Conservative), MaskVariant::Unmasked)
        .unwrap();
    assert_eq!(fixture.generator.calls(), 2);

    // A new generator version must not reuse entries of the old one.
    let upgraded = TestRegridder::with_generator(SyntheticGenerator::new().with_version("synthetic-2"));
    let request = upgraded
        .regridder
        .request(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked, None)
        .unwrap();
    let old = fixture
        .regridder
        .request(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked, None)
        .unwrap();
    assert_ne!(upgraded.cache().key_for(&request), fixture.cache().key_for(&old));
}

#[test]
fn test_unpromoted_write_is_invisible_and_swept() {
    let fixture = TestRegridder::new();
    let r = &fixture.regridder;
    let request = r
        .request(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked, None)
        .unwrap();

    // A writer that dies between writing and renaming.
    let generated = fixture.generator.compute(&request).unwrap();
    let staged = fixture.cache().stage_weights(&request, &generated.weights).unwrap();
    let partial = staged.path().to_path_buf();
    drop(staged);
    assert!(partial.exists());

    assert!(fixture.cache().lookup(&request).unwrap().is_none());
    assert!(!r.verify(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked).unwrap());

    r.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked).unwrap();
    assert_eq!(fixture.generator.calls(), 2);
    assert!(r.verify(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked).unwrap());

    assert_eq!(fixture.cache().sweep_partials(Duration::from_secs(3600)).unwrap(), 0);
    assert_eq!(fixture.cache().sweep_partials(Duration::ZERO).unwrap(), 1);
    assert!(!partial.exists());
}

#[test]
fn test_truncated_entry_is_recomputed() {
    let fixture = TestRegridder::new();
    let request = fixture
        .regridder
        .request(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked, None)
        .unwrap();
    fixture.cache().get_or_compute(&request).unwrap();

    let key = fixture.cache().key_for(&request);
    let path = fixture.cache().entry_path(&key, EntryKind::Weights);
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    // A fresh instance has nothing in memory and must notice the damage.
    let other = fixture.reopen();
    assert!(matches!(
        other.cache().lookup(&request),
        Err(RegridError::CacheCorruption { .. })
    ));
    other.cache().get_or_compute(&request).unwrap();
    assert_eq!(fixture.generator.calls(), 2);
    assert!(other
        .verify(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
        .unwrap());
}

#[test]
fn test_failures_are_remembered_until_invalidated() {
    let fixture = TestRegridder::with_generator(SyntheticGenerator::failing());
    let r = &fixture.regridder;

    let first = r
        .weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
        .unwrap_err();
    assert!(matches!(first, RegridError::WeightGeneration { .. }));
    let context = first.context().unwrap();
    assert_eq!(context.source, grids::OCEAN);
    assert_eq!(context.target, grids::ATMOS);

    fixture.generator.set_failing(false);
    let second = r
        .weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
        .unwrap_err();
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(fixture.generator.calls(), 1);

    r.rebuild(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked).unwrap();
    assert_eq!(fixture.generator.calls(), 2);
}

#[test]
fn test_zero_ttl_disables_failure_memory() {
    let fixture = TestRegridder::with_settings(SyntheticGenerator::failing(), |settings| {
        settings.negative_ttl = Duration::ZERO;
    });
    let r = &fixture.regridder;
    assert!(r.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked).is_err());
    fixture.generator.set_failing(false);
    assert!(r.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked).is_ok());
    assert_eq!(fixture.generator.calls(), 2);
}

#[test]
fn test_concurrent_callers_share_one_failure_with_zero_ttl() {
    let fixture = TestRegridder::with_settings(
        SyntheticGenerator::failing().with_delay(Duration::from_millis(200)),
        |settings| settings.negative_ttl = Duration::ZERO,
    );
    let other = fixture.reopen();

    let results: Vec<_> = thread::scope(|s| {
        let mut handles = Vec::new();
        for _ in 0..6 {
            let regridder = fixture.regridder.clone();
            handles.push(s.spawn(move || {
                regridder.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
            }));
        }
        for _ in 0..3 {
            let other = &other;
            handles.push(s.spawn(move || {
                other.weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(fixture.generator.calls(), 1);
    let messages: Vec<String> = results
        .into_iter()
        .map(|r| match r {
            Err(err @ RegridError::WeightGeneration { .. }) => err.to_string(),
            other => panic!("expected a generation failure, got {:?}", other.map(|a| a.nnz())),
        })
        .collect();
    assert!(messages.iter().all(|m| m == &messages[0]));

    // Nothing is remembered once the callers are gone.
    fixture.generator.set_failing(false);
    fixture
        .regridder
        .weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
        .unwrap();
    assert_eq!(fixture.generator.calls(), 2);
}

#[test]
fn test_entries_survive_a_new_instance() {
    let fixture = TestRegridder::new();
    let first = fixture
        .regridder
        .weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
        .unwrap();
    let other = fixture.reopen();
    let second = other
        .weights_for(grids::OCEAN, &atmos(), None, MaskVariant::Unmasked)
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first.weights, second.weights);
    assert_eq!(fixture.generator.calls(), 1);
    assert_eq!(other.cache().stats().hits, 1);
}
