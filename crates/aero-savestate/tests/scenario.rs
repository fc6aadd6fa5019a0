use aero_savestate::{
    pack, unpack, ItemKind, RegisteredItem, SaveError, SaveManager, StateArena,
};
use proptest::prelude::*;

fn score_and_paused() -> (SaveManager<StateArena>, StateArena, u64) {
    let mut arena = StateArena::new();
    let base = arena.alloc(8, 4).unwrap();
    arena.write_u32(base, 1234).unwrap();
    arena.write_bool(base + 4, true).unwrap();

    let mut manager = SaveManager::new();
    {
        let mut r = manager.registrar().unwrap();
        r.reg::<u32>(base, "score").unwrap();
        r.reg::<bool>(base + 4, "paused").unwrap();
    }
    manager.seal().unwrap();
    (manager, arena, base)
}

#[test]
fn score_and_paused_export_pack_and_restore() {
    let (mut manager, mut arena, base) = score_and_paused();

    assert_eq!(
        manager.export_json(&arena).unwrap(),
        r#"{"paused":true,"score":1234}"#
    );

    assert_eq!(manager.binary_size(), 5);
    let mut buf = [0u8; 5];
    manager.save_binary(&mut arena, &mut buf).unwrap();

    let mut fresh = StateArena::new();
    assert_eq!(fresh.alloc(8, 4).unwrap(), base);
    manager.load_binary(&mut fresh, &buf).unwrap();
    assert_eq!(fresh.read_u32(base).unwrap(), 1234);
    assert!(fresh.read_bool(base + 4).unwrap());
}

#[test]
fn export_is_byte_identical_across_runs() {
    let mut arena = StateArena::new();
    let base = arena.alloc(512, 8).unwrap();
    for i in 0..64u64 {
        arena.write_u32(base + i * 4, (i * 2654435761 % 1000) as u32).unwrap();
    }
    arena.write_f64(base + 256, 1.0 / 3.0).unwrap();

    let mut manager = SaveManager::new();
    {
        let mut r = manager.registrar().unwrap();
        let mut dsp = r.container("dsp").unwrap();
        dsp.reg_array::<u32>(base, "m_taps", 64).unwrap();
        dsp.reg::<f64>(base + 256, "gain").unwrap();
        dsp.reg_struct(base + 264, "filter", 16, |f| {
            f.reg::<u64>(0, "state")?;
            f.reg::<i32>(8, "shift")?;
            f.reg::<bool>(12, "enabled")
        })
        .unwrap();
    }
    manager.seal().unwrap();

    let first = manager.export_json(&arena).unwrap();
    let second = manager.export_json(&arena).unwrap();
    assert_eq!(first, second);
    assert!(first.contains("\"gain\":0.333333"));
}

#[test]
fn empty_structures_are_pruned_at_seal() {
    let mut arena = StateArena::new();
    let base = arena.alloc(16, 8).unwrap();
    let mut manager = SaveManager::<StateArena>::new();
    {
        let mut r = manager.registrar().unwrap();
        r.reg_struct(base, "empty", 8, |_| Ok(())).unwrap();
        r.container("hollow")
            .unwrap()
            .reg_struct(base, "nothing", 4, |_| Ok(()))
            .unwrap();
        r.reg::<u8>(base + 8, "kept").unwrap();
    }
    manager.seal().unwrap();

    let root = manager.root();
    assert!(root.find("empty").is_none());
    assert!(root.find("hollow").is_none());
    assert_eq!(root.items().len(), 1);
    assert_eq!(manager.binary_size(), 1);
}

#[test]
fn sibling_names_must_be_unique_in_either_order() {
    for (first, second) in [("m_clock", "clock"), ("clock", "m_clock")] {
        let mut root = RegisteredItem::root();
        root.append(0, ItemKind::Uint, 4, first).unwrap();
        let err = root.append(4, ItemKind::Struct, 8, second).unwrap_err();
        assert!(matches!(err, SaveError::DuplicateName(_)));
        assert!(err.is_registration_error());
    }
}

#[test]
fn codec_reports_full_size_for_any_capacity() {
    let (manager, arena, _) = score_and_paused();
    let root = manager.root();
    let full = root.binary_size();

    for capacity in 0..=full as usize {
        let mut buf = [0xeeu8; 8];
        let produced = pack(root, &arena, &mut buf[..capacity], 0).unwrap();
        assert_eq!(produced, full);
        assert!(buf[capacity..].iter().all(|&b| b == 0xee));

        let mut target = StateArena::new();
        target.alloc(8, 4).unwrap();
        let consumed = unpack(root, &mut target, &buf[..capacity], 0).unwrap();
        assert_eq!(consumed, full);
    }
}

fn voices(arena: &mut StateArena) -> (SaveManager<StateArena>, u64) {
    let base = arena.alloc(8 * 16 + 32, 8).unwrap();
    let mut manager = SaveManager::new();
    {
        let mut r = manager.registrar().unwrap();
        let mut sound = r.container("sound").unwrap();
        sound
            .reg_struct_array(base, "m_voices", 8, 16, |v| {
                v.reg::<u32>(0, "phase")?;
                v.reg::<u16>(4, "step")?;
                v.reg::<i8>(6, "volume")?;
                v.reg::<bool>(7, "on")?;
                v.reg::<f64>(8, "pan")
            })
            .unwrap();
        sound.reg_array::<u64>(base + 128, "history", 4).unwrap();
    }
    manager.seal().unwrap();
    (manager, base)
}

proptest! {
    #[test]
    fn pack_then_unpack_reproduces_every_field(raw in proptest::collection::vec(any::<u8>(), 160)) {
        let mut source = StateArena::new();
        let (manager, base) = voices(&mut source);
        for (i, byte) in raw.iter().enumerate() {
            source.write_u8(base + i as u64, *byte).unwrap();
        }
        for voice in 0..8u64 {
            source.write_bool(base + voice * 16 + 7, raw[voice as usize] & 1 != 0).unwrap();
        }

        let len = manager.binary_size() as usize;
        prop_assert_eq!(len, 8 * 16 + 32);
        let mut buf = vec![0u8; len];
        prop_assert_eq!(pack(manager.root(), &source, &mut buf, 0).unwrap(), len as u64);

        let mut target = StateArena::new();
        let (_, target_base) = voices(&mut target);
        prop_assert_eq!(target_base, base);
        prop_assert_eq!(unpack(manager.root(), &mut target, &buf, 0).unwrap(), len as u64);

        for voice in 0..8u64 {
            let at = base + voice * 16;
            prop_assert_eq!(target.slice(at, 7).unwrap(), source.slice(at, 7).unwrap());
            prop_assert_eq!(target.read_bool(at + 7).unwrap(), source.read_bool(at + 7).unwrap());
            prop_assert_eq!(target.slice(at + 8, 8).unwrap(), source.slice(at + 8, 8).unwrap());
        }
        prop_assert_eq!(
            target.slice(base + 128, 32).unwrap(),
            source.slice(base + 128, 32).unwrap()
        );
    }
}
