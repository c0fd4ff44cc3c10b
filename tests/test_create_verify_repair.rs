//! End-to-end create / verify / repair tests over real files.

use par3rs::codec::EccMethod;
use par3rs::creator::{create, CreateReport, CreatorOptions};
use par3rs::file_ops::{collect_par_files, load_packet_set};
use par3rs::map::InputEntry;
use par3rs::packets::PacketSet;
use par3rs::repair::{repair, RepairOptions, RepairOutcome};
use par3rs::verify::{verify, VerifyOptions, VerifyVerdict};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn pattern(len: usize, seed: u32) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let x = (i as u32).wrapping_add(seed).wrapping_mul(2654435761);
            (x >> 24) as u8
        })
        .collect()
}

fn write_input(dir: &Path, name: &str, data: &[u8]) -> InputEntry {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    InputEntry {
        name: name.to_string(),
        path,
        size: data.len() as u64,
    }
}

fn quiet_verify() -> VerifyOptions {
    VerifyOptions {
        search_limit_ms: None,
        quiet: true,
    }
}

fn quiet_repair() -> RepairOptions {
    RepairOptions {
        memory_limit: 0,
        quiet: true,
    }
}

fn create_set(
    dir: &TempDir,
    inputs: Vec<InputEntry>,
    tweak: impl FnOnce(&mut CreatorOptions),
) -> (PathBuf, CreateReport) {
    let index = dir.path().join("set.par3");
    let mut options = CreatorOptions {
        block_size: Some(1024),
        ..Default::default()
    };
    tweak(&mut options);
    let report = create(dir.path(), inputs, vec![], &index, &options).unwrap();
    (index, report)
}

fn load(index: &Path) -> PacketSet {
    load_packet_set(&collect_par_files(index)).unwrap()
}

#[test]
fn create_then_verify_reports_all_correct() {
    let dir = TempDir::new().unwrap();
    let a = write_input(dir.path(), "a.bin", &pattern(4096, 1));
    let (index, report) = create_set(&dir, vec![a], |o| o.recovery_count = Some(2));
    assert_eq!(report.block_count, 4);
    assert_eq!(report.recovery_count, 2);

    let set = load(&index);
    assert_eq!(set.set_id, report.set_id);
    let verdict = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(verdict.verdict, VerifyVerdict::AllCorrect);
    assert_eq!(verdict.known_blocks, 4);
}

#[test]
fn set_id_is_deterministic_for_identical_inputs() {
    let dir = TempDir::new().unwrap();
    let data = pattern(3000, 2);
    let a = write_input(dir.path(), "a.bin", &data);
    let (_, first) = create_set(&dir, vec![a], |o| o.recovery_count = Some(1));

    let dir2 = TempDir::new().unwrap();
    let b = write_input(dir2.path(), "a.bin", &data);
    let index2 = dir2.path().join("set.par3");
    let options = CreatorOptions {
        block_size: Some(1024),
        recovery_count: Some(1),
        ..Default::default()
    };
    let second = create(dir2.path(), vec![b], vec![], &index2, &options).unwrap();
    assert_eq!(first.set_id, second.set_id);
}

#[test]
fn damaged_blocks_are_repaired_with_cauchy() {
    let dir = TempDir::new().unwrap();
    let data = pattern(4096, 3);
    let a = write_input(dir.path(), "a.bin", &data);
    let (index, _) = create_set(&dir, vec![a], |o| o.recovery_count = Some(2));

    // Corrupt two whole blocks in the middle
    let mut damaged = data.clone();
    for byte in damaged[1024..3072].iter_mut() {
        *byte = !*byte;
    }
    fs::write(dir.path().join("a.bin"), &damaged).unwrap();

    let set = load(&index);
    let mut report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(report.verdict, VerifyVerdict::RepairPossible);
    assert_eq!(report.lost_blocks, 2);

    let outcome = repair(&set, dir.path(), &mut report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), data);
    // The damaged original was kept aside
    assert_eq!(fs::read(dir.path().join("a.bin.1")).unwrap(), damaged);
}

#[test]
fn deleted_file_restored_with_full_redundancy() {
    let dir = TempDir::new().unwrap();
    let data = pattern(4096, 4);
    let a = write_input(dir.path(), "a.bin", &data);
    let (index, report) = create_set(&dir, vec![a], |o| o.redundancy_percent = 100);
    assert_eq!(report.recovery_count, 4);

    fs::remove_file(dir.path().join("a.bin")).unwrap();

    let set = load(&index);
    let mut report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(report.verdict, VerifyVerdict::RepairPossible);

    let outcome = repair(&set, dir.path(), &mut report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), data);
}

#[test]
fn misnamed_files_are_matched_and_renamed() {
    let dir = TempDir::new().unwrap();
    let data_a = pattern(2048, 5);
    let data_b = pattern(3000, 6);
    let a = write_input(dir.path(), "a.bin", &data_a);
    let b = write_input(dir.path(), "b.bin", &data_b);
    let (index, _) = create_set(&dir, vec![a, b], |o| o.recovery_count = Some(1));

    fs::rename(dir.path().join("a.bin"), dir.path().join("a.bin.bak")).unwrap();
    fs::rename(dir.path().join("b.bin"), dir.path().join("b.bin.bak")).unwrap();

    let extras = vec![
        dir.path().join("a.bin.bak"),
        dir.path().join("b.bin.bak"),
    ];
    let set = load(&index);
    let mut report = verify(&set, dir.path(), &extras, &quiet_verify()).unwrap();
    assert_eq!(report.misnamed_files, 2);
    assert_eq!(report.verdict, VerifyVerdict::RepairPossible);

    let outcome = repair(&set, dir.path(), &mut report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(outcome.repaired_files, 2);
    assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), data_a);
    assert_eq!(fs::read(dir.path().join("b.bin")).unwrap(), data_b);
    assert!(!dir.path().join("a.bin.bak").exists());
}

#[test]
fn fft_set_repairs_damage() {
    let dir = TempDir::new().unwrap();
    let data = pattern(10 * 1024, 7);
    let a = write_input(dir.path(), "a.bin", &data);
    let (index, _) = create_set(&dir, vec![a], |o| {
        o.ecc = EccMethod::Fft;
        o.recovery_count = Some(4);
    });

    let mut damaged = data.clone();
    for byte in damaged[0..1024].iter_mut() {
        *byte ^= 0x5A;
    }
    for byte in damaged[8 * 1024..9 * 1024].iter_mut() {
        *byte ^= 0xA5;
    }
    fs::write(dir.path().join("a.bin"), &damaged).unwrap();

    let set = load(&index);
    let mut report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(report.verdict, VerifyVerdict::RepairPossible);
    assert_eq!(report.lost_blocks, 2);

    let outcome = repair(&set, dir.path(), &mut report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), data);
}

#[test]
fn fft_interleaved_cohorts_repair_independently() {
    let dir = TempDir::new().unwrap();
    let data = pattern(9 * 1024, 8);
    let a = write_input(dir.path(), "a.bin", &data);
    let (index, report) = create_set(&dir, vec![a], |o| {
        o.ecc = EccMethod::Fft;
        o.interleave = 2; // 3 cohorts
        o.recovery_count = Some(3);
    });
    // One recovery block per cohort
    assert_eq!(report.recovery_count, 3);

    // Blocks 0 and 4 live in different cohorts (0 and 1), so one loss
    // per cohort stays repairable
    let mut damaged = data.clone();
    for byte in damaged[0..1024].iter_mut() {
        *byte ^= 0xFF;
    }
    for byte in damaged[4 * 1024..5 * 1024].iter_mut() {
        *byte ^= 0xFF;
    }
    fs::write(dir.path().join("a.bin"), &damaged).unwrap();

    let set = load(&index);
    let mut verify_report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(verify_report.verdict, VerifyVerdict::RepairPossible);

    let outcome = repair(&set, dir.path(), &mut verify_report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), data);
}

#[test]
fn cohort_losses_beyond_its_recovery_are_not_repairable() {
    let dir = TempDir::new().unwrap();
    let data = pattern(9 * 1024, 9);
    let a = write_input(dir.path(), "a.bin", &data);
    let (index, _) = create_set(&dir, vec![a], |o| {
        o.ecc = EccMethod::Fft;
        o.interleave = 2;
        o.recovery_count = Some(3);
    });

    // Blocks 0 and 3 are both in cohort 0, which has only one recovery
    let mut damaged = data.clone();
    for byte in damaged[0..1024].iter_mut() {
        *byte ^= 0xFF;
    }
    for byte in damaged[3 * 1024..4 * 1024].iter_mut() {
        *byte ^= 0xFF;
    }
    fs::write(dir.path().join("a.bin"), &damaged).unwrap();

    let set = load(&index);
    let report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(report.verdict, VerifyVerdict::RepairNotPossible);
}

#[test]
fn repair_not_possible_without_enough_recovery() {
    let dir = TempDir::new().unwrap();
    let data = pattern(4096, 10);
    let a = write_input(dir.path(), "a.bin", &data);
    let (index, _) = create_set(&dir, vec![a], |o| o.recovery_count = Some(1));

    fs::remove_file(dir.path().join("a.bin")).unwrap();

    let set = load(&index);
    let mut report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(report.verdict, VerifyVerdict::RepairNotPossible);

    let outcome = repair(&set, dir.path(), &mut report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::NotPossible);
}

#[test]
fn trial_mode_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let a = write_input(dir.path(), "a.bin", &pattern(4096, 11));
    let (index, report) = create_set(&dir, vec![a], |o| {
        o.recovery_count = Some(2);
        o.trial = true;
    });

    assert!(!index.exists());
    assert!(report.files.iter().all(|f| !f.path.exists()));
    assert!(report.files.iter().all(|f| f.size > 0));
}

#[test]
fn data_volume_restores_without_recovery_blocks() {
    let dir = TempDir::new().unwrap();
    let data = pattern(3 * 1024, 12);
    let a = write_input(dir.path(), "a.bin", &data);
    let (index, _) = create_set(&dir, vec![a], |o| {
        o.store_data_packets = true;
    });

    fs::remove_file(dir.path().join("a.bin")).unwrap();

    let set = load(&index);
    assert!(!set.data.is_empty());
    let mut report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(report.verdict, VerifyVerdict::RepairPossible);
    assert_eq!(report.lost_blocks, 0);

    let outcome = repair(&set, dir.path(), &mut report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), data);
}

#[test]
fn packed_tails_are_restored_from_recovery() {
    let dir = TempDir::new().unwrap();
    let data_a = pattern(1500, 13);
    let data_b = pattern(500, 14);
    let a = write_input(dir.path(), "a.bin", &data_a);
    let b = write_input(dir.path(), "b.bin", &data_b);
    let (index, report) = create_set(&dir, vec![a, b], |o| o.recovery_count = Some(2));
    // One full block from a plus a tail block shared by both tails
    assert_eq!(report.block_count, 2);

    fs::remove_file(dir.path().join("b.bin")).unwrap();

    let set = load(&index);
    let mut verify_report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(verify_report.verdict, VerifyVerdict::RepairPossible);

    let outcome = repair(&set, dir.path(), &mut verify_report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(dir.path().join("b.bin")).unwrap(), data_b);
}

#[test]
fn tiny_file_restored_from_inline_tail() {
    let dir = TempDir::new().unwrap();
    let data_a = pattern(2048, 15);
    let tiny = pattern(25, 16);
    let a = write_input(dir.path(), "a.bin", &data_a);
    let t = write_input(dir.path(), "tiny.bin", &tiny);
    let (index, report) = create_set(&dir, vec![a, t], |o| o.recovery_count = Some(1));
    // The 25-byte file contributes no blocks at all
    assert_eq!(report.block_count, 2);

    fs::remove_file(dir.path().join("tiny.bin")).unwrap();

    let set = load(&index);
    let mut verify_report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(verify_report.verdict, VerifyVerdict::RepairPossible);
    assert_eq!(verify_report.lost_blocks, 0);

    let outcome = repair(&set, dir.path(), &mut verify_report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(dir.path().join("tiny.bin")).unwrap(), tiny);
}

#[test]
fn split_repair_matches_unsplit_result() {
    let dir = TempDir::new().unwrap();
    let data = pattern(8 * 1024, 17);
    let a = write_input(dir.path(), "a.bin", &data);
    let (index, _) = create_set(&dir, vec![a], |o| o.recovery_count = Some(3));

    let mut damaged = data.clone();
    for byte in damaged[2048..5120].iter_mut() {
        *byte ^= 0x33;
    }
    fs::write(dir.path().join("a.bin"), &damaged).unwrap();

    let set = load(&index);
    let mut report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(report.lost_blocks, 3);

    // A limit this small forces several split iterations per block
    let options = RepairOptions {
        memory_limit: 2048,
        quiet: true,
    };
    let outcome = repair(&set, dir.path(), &mut report, &options).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), data);
}

#[test]
fn dedup_set_verifies_and_repairs() {
    let dir = TempDir::new().unwrap();
    let data = pattern(4096, 18);
    let a = write_input(dir.path(), "a.bin", &data);
    let copy = write_input(dir.path(), "a.copy.bin", &data);
    let (index, report) = create_set(&dir, vec![a, copy], |o| {
        o.dedup = 2;
        o.recovery_count = Some(2);
    });
    // Identical content shares the same four blocks
    assert_eq!(report.block_count, 4);

    fs::remove_file(dir.path().join("a.copy.bin")).unwrap();

    let set = load(&index);
    let mut verify_report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    // Every block survives in a.bin, so nothing is lost
    assert_eq!(verify_report.lost_blocks, 0);
    assert_eq!(verify_report.verdict, VerifyVerdict::RepairPossible);

    let outcome = repair(&set, dir.path(), &mut verify_report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(dir.path().join("a.copy.bin")).unwrap(), data);
}

#[test]
fn subdirectory_files_round_trip() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
    let data = pattern(2500, 19);
    let path = dir.path().join("sub/inner/deep.bin");
    fs::write(&path, &data).unwrap();
    let entry = InputEntry {
        name: "sub/inner/deep.bin".into(),
        path,
        size: data.len() as u64,
    };
    let (index, _) = create_set(&dir, vec![entry], |o| o.redundancy_percent = 100);

    fs::remove_file(dir.path().join("sub/inner/deep.bin")).unwrap();

    let set = load(&index);
    let mut report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(report.verdict, VerifyVerdict::RepairPossible);

    let outcome = repair(&set, dir.path(), &mut report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(
        fs::read(dir.path().join("sub/inner/deep.bin")).unwrap(),
        data
    );
}

#[test]
fn permission_packets_are_stored_and_referenced() {
    let dir = TempDir::new().unwrap();
    let a = write_input(dir.path(), "a.bin", &pattern(2048, 21));
    let (index, _) = create_set(&dir, vec![a], |o| {
        o.recovery_count = Some(1);
        o.unix_permissions = true;
        o.fat_permissions = true;
    });

    let set = load(&index);
    assert_eq!(set.permissions.len(), 2);
    let (_, file) = &set.files[0];
    assert_eq!(file.options.len(), 2);
    for checksum in &file.options {
        assert!(set.permission(checksum).is_some());
    }

    let report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    assert_eq!(report.verdict, VerifyVerdict::AllCorrect);
    assert_eq!(report.bad_property_files, 0);
}

#[cfg(unix)]
#[test]
fn changed_mode_is_reported_as_bad_property() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let a = write_input(dir.path(), "a.bin", &pattern(2048, 22));
    let path = dir.path().join("a.bin");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    let (index, _) = create_set(&dir, vec![a], |o| {
        o.recovery_count = Some(1);
        o.unix_permissions = true;
    });

    fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

    let set = load(&index);
    let report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    // Content is intact, only the property differs
    assert_eq!(report.verdict, VerifyVerdict::AllCorrect);
    assert_eq!(report.bad_property_files, 1);
}

#[cfg(unix)]
#[test]
fn restored_file_gets_its_stored_mode_back() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let data = pattern(2048, 23);
    let a = write_input(dir.path(), "a.bin", &data);
    let path = dir.path().join("a.bin");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
    let (index, _) = create_set(&dir, vec![a], |o| {
        o.redundancy_percent = 100;
        o.unix_permissions = true;
    });

    fs::remove_file(&path).unwrap();

    let set = load(&index);
    let mut report = verify(&set, dir.path(), &[], &quiet_verify()).unwrap();
    let outcome = repair(&set, dir.path(), &mut report, &quiet_repair()).unwrap();
    assert_eq!(outcome.outcome, RepairOutcome::Success);
    assert_eq!(fs::read(&path).unwrap(), data);
    let mode = fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o640);
}

#[test]
fn any_single_volume_describes_the_whole_set() {
    let dir = TempDir::new().unwrap();
    let a = write_input(dir.path(), "a.bin", &pattern(8 * 1024, 20));
    let (index, report) = create_set(&dir, vec![a], |o| o.recovery_count = Some(4));

    // Drop the index file; the volumes must still carry the metadata
    fs::remove_file(&index).unwrap();
    let volume = report
        .files
        .iter()
        .map(|f| f.path.clone())
        .find(|p| p.exists())
        .unwrap();

    let set = load_packet_set(&[volume]).unwrap();
    assert_eq!(set.files.len(), 1);
    assert_eq!(set.root.lowest_unused_block, 8);
}
