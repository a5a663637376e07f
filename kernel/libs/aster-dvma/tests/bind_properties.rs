// SPDX-License-Identifier: MPL-2.0

//! Randomized checks of the invariants of bound cookie lists.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use aster_dvma::{
    BindStatus, Cookie, DeviceAttributes, DmaDirection, DmaHandle, DmaObject, Domain, DvmaConfig,
    Error, IotlbInvalidator, PAGE_SIZE, Paddr, PhysTranslator, WaitPolicy,
};
use rand::{Rng, SeedableRng, rngs::SmallRng};

const NR_ROUNDS: usize = 400;

/// An IOTLB model that remembers which pages may hold stale translations.
#[derive(Clone, Default)]
struct ModelIotlb {
    stale: Arc<Mutex<BTreeSet<u64>>>,
}

impl ModelIotlb {
    fn retire(&self, daddr: u64, pages: usize) {
        let mut stale = self.stale.lock().unwrap();
        stale.extend((0..pages as u64).map(|i| daddr / PAGE_SIZE as u64 + i));
    }

    fn is_stale(&self, daddr: u64, pages: usize) -> bool {
        let stale = self.stale.lock().unwrap();
        (0..pages as u64).any(|i| stale.contains(&(daddr / PAGE_SIZE as u64 + i)))
    }
}

impl IotlbInvalidator for ModelIotlb {
    fn invalidate_all(&self) {
        self.stale.lock().unwrap().clear();
    }

    fn invalidate_range(&self, daddr: u64, len: u64) {
        let first = daddr / PAGE_SIZE as u64;
        let last = (daddr + len).div_ceil(PAGE_SIZE as u64);
        let mut stale = self.stale.lock().unwrap();
        for pfn in first..last {
            stale.remove(&pfn);
        }
    }
}

/// Maps virtual page `n` to physical page `n + 0x1000`.
struct Shifted;

impl PhysTranslator for Shifted {
    fn virt_to_phys(&self, vaddr: usize) -> Option<Paddr> {
        Some(vaddr as Paddr + 0x1000 * PAGE_SIZE as Paddr)
    }
}

fn random_attrs(rng: &mut SmallRng) -> DeviceAttributes {
    let page = PAGE_SIZE as u64;
    let boundaries = [0, page, 2 * page, 4 * page, 16 * page];
    let granularities = [1, 0x200, 0x800, page];
    DeviceAttributes {
        segment_boundary: boundaries[rng.random_range(0..boundaries.len())],
        granularity: granularities[rng.random_range(0..granularities.len())],
        max_cookie_size: rng.random_range(page..=8 * page),
        max_transfer_size: if rng.random_bool(0.5) {
            u64::MAX
        } else {
            rng.random_range(page..=16 * page)
        },
        max_cookie_count: if rng.random_bool(0.5) {
            usize::MAX
        } else {
            rng.random_range(2..=8)
        },
        ..Default::default()
    }
}

fn random_frames(rng: &mut SmallRng, nr: usize) -> Vec<Paddr> {
    (0..nr)
        .map(|_| rng.random_range(0x100..0x10000u64) * PAGE_SIZE as u64)
        .collect()
}

fn crosses(cookie: &Cookie, boundary: u64) -> bool {
    boundary != 0 && cookie.device_address / boundary != (cookie.end() - 1) / boundary
}

/// Binds `object`, checks every window and returns all cookies.
fn bind_and_check(
    handle: &mut DmaHandle<'_>,
    object: &DmaObject<'_>,
    len: u64,
) -> Result<Vec<Cookie>, Error> {
    let attrs = handle.attributes().clone();
    let status = handle
        .bind(object, DmaDirection::Bidirectional, WaitPolicy::NoWait)?
        .status;
    let count = match status {
        BindStatus::FullyMapped => 1,
        BindStatus::PartiallyMapped(count) => count,
    };
    assert_eq!(count, handle.window_count());

    let mut all = Vec::new();
    for index in 0..count {
        let window = handle.window(index).unwrap();
        assert_eq!(window.offset, all.iter().map(|c: &Cookie| c.length as u64).sum::<u64>());
        assert!(window.cookies.len() <= attrs.max_cookie_count);
        assert!(window.length <= attrs.max_transfer_size);
        if index > 0 {
            assert_eq!(window.offset % attrs.granularity, 0);
        }
        all.extend_from_slice(window.cookies);
    }

    assert_eq!(all.as_slice(), handle.cookies());
    assert_eq!(all.iter().map(|c| c.length as u64).sum::<u64>(), len);
    for cookie in &all {
        assert!(cookie.length > 0);
        assert!(cookie.length as u64 <= attrs.max_cookie_size);
        assert!(!crosses(cookie, attrs.segment_boundary), "{:?}", cookie);
    }
    Ok(all)
}

#[test]
fn cookie_lists_respect_device_limits() {
    let iotlb = ModelIotlb::default();
    let domain = Domain::with_range(
        DvmaConfig::default(),
        0x1000..0x1000_0000,
        Box::new(iotlb.clone()),
    );
    let mut rng = SmallRng::seed_from_u64(0);

    for _ in 0..NR_ROUNDS {
        let attrs = random_attrs(&mut rng);
        let mut handle = DmaHandle::allocate(&domain, attrs, WaitPolicy::NoWait).unwrap();

        let offset = rng.random_range(0..PAGE_SIZE);
        let len = rng.random_range(1..=12 * PAGE_SIZE);
        let frames = random_frames(&mut rng, (offset + len).div_ceil(PAGE_SIZE));
        let object = DmaObject::PageArray {
            pages: &frames,
            offset,
            len,
        };

        let cookies = match bind_and_check(&mut handle, &object, len as u64) {
            Ok(cookies) => cookies,
            // A granularity chain may not fit any window of the device.
            Err(Error::IncompatibleConfig) => {
                assert!(!handle.is_bound());
                continue;
            }
            Err(err) => panic!("bind failed: {:?}", err),
        };

        let (base, pages) = handle.mapped_range().unwrap();
        assert!(!iotlb.is_stale(base, pages));
        for (i, frame) in frames.iter().enumerate() {
            let daddr = base + (i * PAGE_SIZE) as u64;
            assert_eq!(domain.translate(daddr), Some(*frame));
        }

        handle.unbind().unwrap();
        iotlb.retire(base, pages);
        for cookie in &cookies {
            assert_eq!(domain.translate(cookie.device_address), None);
        }
        handle.free().unwrap();
    }

    let stats = domain.stats();
    assert_eq!(stats.active_handles, 0);
    assert_eq!(stats.active_binds, 0);
}

#[test]
fn reused_addresses_are_never_stale() {
    let iotlb = ModelIotlb::default();
    let config = DvmaConfig {
        fast_range_pages: 2,
        ..Default::default()
    };
    // A small space forces frequent reuse.
    let domain = Domain::with_range(config, 0x1000..0x21000, Box::new(iotlb.clone()));
    let mut rng = SmallRng::seed_from_u64(1);

    let mut handles: Vec<_> = (0..4)
        .map(|_| DmaHandle::allocate(&domain, DeviceAttributes::default(), WaitPolicy::NoWait))
        .collect::<Result<_, _>>()
        .unwrap();

    for _ in 0..NR_ROUNDS {
        let handle = &mut handles[rng.random_range(0..4)];
        if let Some((base, pages)) = handle.mapped_range() {
            handle.unbind().unwrap();
            iotlb.retire(base, pages);
            continue;
        }

        let vaddr = rng.random_range(0..0x100_0000usize);
        let len = rng.random_range(1..=3 * PAGE_SIZE);
        let object = DmaObject::Virt {
            vaddr,
            len,
            mmu: &Shifted,
        };
        let bound = handle
            .bind(&object, DmaDirection::ToDevice, WaitPolicy::NoWait)
            .map(|_| ());
        match bound {
            Ok(()) => {
                let (base, pages) = handle.mapped_range().unwrap();
                assert!(!iotlb.is_stale(base, pages), "stale pages at {:#x}", base);
            }
            Err(Error::OutOfSpace) => {}
            Err(err) => panic!("bind failed: {:?}", err),
        }
    }

    let stats = domain.stats();
    assert!(stats.fast_path_binds > 0);
    assert!(stats.skipped_flushes + stats.global_flushes > 0);
}

#[test]
fn fast_and_general_binds_agree() {
    let mut rng = SmallRng::seed_from_u64(2);
    let fast_domain = Domain::with_range(
        DvmaConfig::default(),
        0x1000..0x1000_0000,
        Box::new(ModelIotlb::default()),
    );
    let general_domain = Domain::with_range(
        DvmaConfig {
            fast_path: false,
            ..Default::default()
        },
        0x1000..0x1000_0000,
        Box::new(ModelIotlb::default()),
    );
    let mut fast =
        DmaHandle::allocate(&fast_domain, DeviceAttributes::default(), WaitPolicy::NoWait)
            .unwrap();
    let mut general =
        DmaHandle::allocate(&general_domain, DeviceAttributes::default(), WaitPolicy::NoWait)
            .unwrap();

    for _ in 0..NR_ROUNDS {
        let vaddr = rng.random_range(0..0x100_0000usize);
        let len = rng.random_range(1..=PAGE_SIZE - vaddr % PAGE_SIZE);
        let object = DmaObject::Virt {
            vaddr,
            len,
            mmu: &Shifted,
        };

        let a = bind_and_check(&mut fast, &object, len as u64).unwrap();
        let b = bind_and_check(&mut general, &object, len as u64).unwrap();
        let base_a = fast.mapped_range().unwrap().0;
        let base_b = general.mapped_range().unwrap().0;
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.device_address - base_a, y.device_address - base_b);
            assert_eq!(x.length, y.length);
        }
        assert_eq!(fast_domain.translate(base_a), general_domain.translate(base_b));

        fast.unbind().unwrap();
        general.unbind().unwrap();
        // Keep the fast range reusable.
        fast_domain.flush_all();
    }

    assert_eq!(fast_domain.stats().fast_path_binds, NR_ROUNDS as u64);
    assert_eq!(general_domain.stats().fast_path_binds, 0);
}

#[test]
fn windows_concatenate_to_the_unbounded_list() {
    let mut rng = SmallRng::seed_from_u64(3);

    for _ in 0..NR_ROUNDS / 4 {
        let limited = DeviceAttributes {
            max_cookie_size: PAGE_SIZE as u64,
            max_transfer_size: rng.random_range(1..=4) * PAGE_SIZE as u64,
            max_cookie_count: rng.random_range(1..=4),
            ..Default::default()
        };
        let unbounded = DeviceAttributes {
            max_transfer_size: u64::MAX,
            max_cookie_count: usize::MAX,
            ..limited.clone()
        };

        let offset = rng.random_range(0..PAGE_SIZE);
        let len = rng.random_range(1..=16 * PAGE_SIZE);
        let frames = random_frames(&mut rng, (offset + len).div_ceil(PAGE_SIZE));
        let object = DmaObject::PageArray {
            pages: &frames,
            offset,
            len,
        };

        let results: Vec<Vec<Cookie>> = [limited, unbounded]
            .into_iter()
            .map(|attrs| {
                let domain = Domain::with_range(
                    DvmaConfig::default(),
                    0x1000..0x1000_0000,
                    Box::new(ModelIotlb::default()),
                );
                let mut handle = DmaHandle::allocate(&domain, attrs, WaitPolicy::NoWait).unwrap();
                let cookies = bind_and_check(&mut handle, &object, len as u64).unwrap();
                handle.unbind().unwrap();
                cookies
            })
            .collect();
        assert_eq!(results[0], results[1]);
    }
}
