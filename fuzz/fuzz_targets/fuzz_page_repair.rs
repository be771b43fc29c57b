//! Fuzz testing for page validation and sector repair.
//!
//! Recovery feeds untrusted disk pages through `validate_and_repair`;
//! whatever the bytes, it must return an error or a bounded status,
//! never panic.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use translog::config::PAGE_SIZE;
use translog::page::{validate_and_repair, PageLayout};

#[derive(Debug, Arbitrary)]
struct PageInput {
    use_crc: bool,
    use_protection: bool,
    expect_page_no: u32,
    expect_file_no: u32,
    bytes: Vec<u8>,
}

fuzz_target!(|input: PageInput| {
    let mut page = input.bytes;
    page.resize(PAGE_SIZE, 0);

    let layout = PageLayout::new(input.use_crc, input.use_protection);
    if let Ok(status) = validate_and_repair(
        &mut page,
        input.expect_page_no & 0x00FF_FFFF,
        input.expect_file_no,
        layout,
    ) {
        assert!(status.verified_end <= PAGE_SIZE);
        // A torn tail must have been cleared in place.
        assert!(page[status.verified_end..].iter().all(|&b| b == 0) || status.verified_end == PAGE_SIZE);
    }
});
