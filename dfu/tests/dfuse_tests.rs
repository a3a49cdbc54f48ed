//! DfuSe engine flows against the simulated device.

mod sim;

use dfu::{
    parse_memory_layout, DfuConnection, DfuError, DfuFile, Dfuse,
    DfuseAlt, DfuseCommand, DfuseDevice, DfuseElement, DfuseImage,
    DfuseOptions, DfuseTarget, NullProgress, Quirks, ID_ANY,
};
use sim::{Request, SimDevice};

fn stm32_device() -> DfuseDevice {
    DfuseDevice {
        vendor: 0x0483,
        product: 0xdf11,
        serial: "3572356B3036".into(),
        quirks: Quirks::default(),
    }
}

fn flash_alts(layout: &str) -> Vec<DfuseAlt> {
    vec![DfuseAlt {
        alt_setting: 0,
        layout: parse_memory_layout(layout),
    }]
}

fn dfuse_file(image: &DfuseImage) -> DfuFile {
    DfuFile {
        data: image.serialize(),
        prefix_len: 0,
        suffix_len: 0,
        vendor: ID_ANY,
        product: ID_ANY,
        bcd_device: ID_ANY,
        bcd_dfu: 0x011a,
    }
}

#[test]
fn erase_then_write_element() {
    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );

    let data = vec![0xcc; 1500];
    dfuse
        .dnload_element(0x0800_0000, &data, 1024, &mut NullProgress)
        .unwrap();

    // One erase per involved page, then one addressed write per chunk
    assert_eq!(
        dev.inspect(|s| s.erased.clone()),
        vec![0x0800_0000, 0x0800_0400]
    );
    let written = dev.inspect(|s| s.written.clone());
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].0, 0x0800_0000);
    assert_eq!(written[0].1.len(), 1024);
    assert_eq!(written[1].0, 0x0800_0400);
    assert_eq!(written[1].1.len(), 476);
    assert_eq!(
        [written[0].1.clone(), written[1].1.clone()].concat(),
        data
    );
}

#[test]
fn chunk_straddling_page_boundary_erases_twice() {
    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/08*001Kg"),
        0,
    );

    dfuse
        .dnload_element(
            0x0800_0200,
            &[0u8; 1024],
            1024,
            &mut NullProgress,
        )
        .unwrap();

    let erased = dev.inspect(|s| s.erased.clone());
    assert_eq!(erased.len(), 2);
    let pages: Vec<u32> =
        erased.iter().map(|a| a & !1023).collect();
    assert_eq!(pages, vec![0x0800_0000, 0x0800_0400]);
}

#[test]
fn already_erased_page_is_skipped() {
    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/08*001Kg"),
        0,
    );

    dfuse
        .dnload_element(0x0800_0000, &[1u8; 512], 1024, &mut NullProgress)
        .unwrap();
    dfuse
        .dnload_element(0x0800_0100, &[2u8; 256], 1024, &mut NullProgress)
        .unwrap();

    // The second element lands in the page erased for the first one
    assert_eq!(dev.inspect(|s| s.erased.clone()), vec![0x0800_0000]);
}

#[test]
fn unwriteable_segment_refused_without_force() {
    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(),
        flash_alts("@ROM /0x1fff0000/01*016Ka"),
        0,
    );

    let err = dfuse
        .dnload_element(
            0x1fff_0000,
            &[0u8; 64],
            1024,
            &mut NullProgress,
        )
        .unwrap_err();
    assert!(matches!(err, DfuError::NotWriteable(0x1fff_003f)));
    assert!(dev.inspect(|s| s.written.is_empty()));
}

#[test]
fn force_overrides_write_check() {
    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let opts: DfuseOptions = ":force".parse().unwrap();
    let mut dfuse = Dfuse::new(
        &conn,
        opts,
        stm32_device(),
        flash_alts("@ROM /0x1fff0000/01*016Ka"),
        0,
    );

    dfuse
        .dnload_element(
            0x1fff_0000,
            &[9u8; 64],
            1024,
            &mut NullProgress,
        )
        .unwrap();
    // Not erasable, so no erases; the write goes through
    assert!(dev.inspect(|s| s.erased.is_empty()));
    assert_eq!(dev.inspect(|s| s.written.len()), 1);
}

#[test]
fn mass_erase_skips_page_erases() {
    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let opts: DfuseOptions = ":mass-erase:force".parse().unwrap();
    let mut dfuse = Dfuse::new(
        &conn,
        opts,
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );

    dfuse.special_command(DfuseCommand::MassErase).unwrap();
    dfuse
        .dnload_element(
            0x0800_0000,
            &[3u8; 2048],
            1024,
            &mut NullProgress,
        )
        .unwrap();

    assert!(dev.inspect(|s| s.mass_erased));
    assert!(dev.inspect(|s| s.erased.is_empty()));
    assert_eq!(dev.inspect(|s| s.written.len()), 2);
}

#[test]
fn mass_erase_timeout_override() {
    let dev = SimDevice::dfuse();
    // The STM32F405 bootloader reports 100 ms for a 32 s erase
    dev.configure(|s| s.poll_timeout = 100);
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );

    dfuse.special_command(DfuseCommand::MassErase).unwrap();
    assert_eq!(dev.inspect(|s| s.sleeps.first().copied()), Some(35000));
}

#[test]
fn stm32h7_erase_unstick() {
    let dev = SimDevice::dfuse();
    dev.configure(|s| s.error_polls_after_erase = 100);
    let conn = DfuConnection::new(dev.clone());
    let device = DfuseDevice {
        serial: "2003645000001234".into(),
        ..stm32_device()
    };
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        device,
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );

    dfuse
        .special_command(DfuseCommand::ErasePage(0x0800_0000))
        .unwrap();

    let clears = dev
        .log()
        .iter()
        .filter(|r| **r == Request::ClrStatus)
        .count();
    assert_eq!(clears, 1);
}

#[test]
fn stuck_device_without_h7_serial_fails() {
    let dev = SimDevice::dfuse();
    dev.configure(|s| s.error_polls_after_erase = 200);
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(), // serial does not begin with 200364500000
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );

    let err = dfuse
        .special_command(DfuseCommand::ErasePage(0x0800_0000))
        .unwrap_err();
    assert!(matches!(err, DfuError::Stuck));
    assert!(!dev.log().contains(&Request::ClrStatus));
}

#[test]
fn erase_outside_layout_refused() {
    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );

    let err = dfuse
        .special_command(DfuseCommand::ErasePage(0x2000_0000))
        .unwrap_err();
    assert!(matches!(err, DfuError::NotErasable(0x2000_0000)));
}

#[test]
fn container_download() {
    let image = DfuseImage {
        targets: vec![DfuseTarget {
            alt_setting: 0,
            name: Some("SRAM".into()),
            elements: vec![DfuseElement {
                address: 0x2000_0000,
                data: vec![0x42; 256],
            }],
        }],
    };
    let file = dfuse_file(&image);

    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(),
        flash_alts("@SRAM /0x20000000/01*016Kd"),
        0,
    );

    dfuse
        .do_dnload(1024, Some(&file), &mut NullProgress)
        .unwrap();

    assert!(dev.log().contains(&Request::SelectAlt(0)));
    let written = dev.inspect(|s| s.written.clone());
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].0, 0x2000_0000);
    assert_eq!(written[0].1, vec![0x42; 256]);
    // Not will-reset: the engine settles back to dfuIDLE
    assert!(dev.log().contains(&Request::Abort));
}

#[test]
fn container_skips_missing_alt_setting() {
    let image = DfuseImage {
        targets: vec![DfuseTarget {
            alt_setting: 7,
            name: None,
            elements: vec![DfuseElement {
                address: 0x2000_0000,
                data: vec![1; 16],
            }],
        }],
    };
    let file = dfuse_file(&image);

    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(),
        flash_alts("@SRAM /0x20000000/01*016Kd"),
        0,
    );

    dfuse
        .do_dnload(1024, Some(&file), &mut NullProgress)
        .unwrap();
    assert!(dev.inspect(|s| s.written.is_empty()));
    assert!(!dev.log().contains(&Request::SelectAlt(7)));
}

#[test]
fn raw_download_rejects_container_file() {
    let image = DfuseImage {
        targets: vec![DfuseTarget {
            alt_setting: 0,
            name: None,
            elements: vec![DfuseElement {
                address: 0x0800_0000,
                data: vec![0; 16],
            }],
        }],
    };
    let file = dfuse_file(&image);

    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let opts: DfuseOptions = "0x08000000".parse().unwrap();
    let mut dfuse = Dfuse::new(
        &conn,
        opts,
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );

    assert!(matches!(
        dfuse.do_dnload(1024, Some(&file), &mut NullProgress),
        Err(DfuError::Usage(_))
    ));
}

#[test]
fn leave_sets_address_then_sends_empty_download() {
    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let opts: DfuseOptions = "0x08000000:leave".parse().unwrap();
    let mut dfuse = Dfuse::new(
        &conn,
        opts,
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );

    // DfuSe command mode: no file, just the options
    dfuse.do_dnload(1024, None, &mut NullProgress).unwrap();

    let dnloads: Vec<(u16, usize)> = dev
        .log()
        .iter()
        .filter_map(|r| match r {
            Request::Dnload { transaction, len } => {
                Some((*transaction, *len))
            }
            _ => None,
        })
        .collect();
    // SET_ADDRESS (5-byte special command), then the zero-length
    // leave request with transaction 2
    assert_eq!(dnloads, vec![(0, 5), (2, 0)]);
    assert_eq!(
        dev.inspect(|s| s.address_pointer),
        0x0800_0000
    );
}

#[test]
fn unprotect_requires_force() {
    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let opts: DfuseOptions = ":unprotect".parse().unwrap();
    let mut dfuse = Dfuse::new(
        &conn,
        opts,
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );
    assert!(matches!(
        dfuse.do_dnload(1024, None, &mut NullProgress),
        Err(DfuError::Usage(_))
    ));

    let opts: DfuseOptions = ":unprotect:force".parse().unwrap();
    let mut dfuse = Dfuse::new(
        &conn,
        opts,
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );
    dfuse.do_dnload(1024, None, &mut NullProgress).unwrap();
    let dnloads: Vec<(u16, usize)> = dev
        .log()
        .iter()
        .filter_map(|r| match r {
            Request::Dnload { transaction, len } => {
                Some((*transaction, *len))
            }
            _ => None,
        })
        .collect();
    assert_eq!(dnloads, vec![(0, 1)]);
}

#[test]
fn upload_limited_to_segment_end() {
    let image: Vec<u8> =
        (0..4096u32).map(|i| (i % 255) as u8).collect();
    let dev = SimDevice::dfuse();
    dev.configure(|s| s.upload_image = image.clone());
    let conn = DfuConnection::new(dev.clone());
    let opts: DfuseOptions = "0x08000200".parse().unwrap();
    let mut dfuse = Dfuse::new(
        &conn,
        opts,
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );

    let mut out = Vec::new();
    let total = dfuse
        .do_upload(1024, &mut out, &mut NullProgress)
        .unwrap();

    // 0x08000200 to the end of the 2 KiB layout is 1536 bytes
    assert_eq!(total, 1536);
    assert_eq!(out, image[..1536]);
}

#[test]
fn write_then_read_back_round_trip() {
    let data: Vec<u8> =
        (0..1500u32).map(|i| (i * 7 % 253) as u8).collect();

    let dev = SimDevice::dfuse();
    let conn = DfuConnection::new(dev.clone());
    let mut dfuse = Dfuse::new(
        &conn,
        DfuseOptions::default(),
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );
    dfuse
        .dnload_element(0x0800_0000, &data, 1024, &mut NullProgress)
        .unwrap();

    // Rebuild the flash contents out of the recorded writes and serve
    // them from a fresh device
    let mut flash = Vec::new();
    for (addr, chunk) in dev.inspect(|s| s.written.clone()) {
        assert_eq!(addr as usize, 0x0800_0000 + flash.len());
        flash.extend_from_slice(&chunk);
    }

    let reader = SimDevice::dfuse();
    reader.configure(|s| s.upload_image = flash);
    let conn = DfuConnection::new(reader.clone());
    let opts: DfuseOptions = "0x08000000:1500".parse().unwrap();
    let mut dfuse = Dfuse::new(
        &conn,
        opts,
        stm32_device(),
        flash_alts("@Internal Flash /0x08000000/02*001Kg"),
        0,
    );
    let mut out = Vec::new();
    dfuse.do_upload(1024, &mut out, &mut NullProgress).unwrap();

    assert_eq!(out, data);
}
