#![forbid(unsafe_code)]
//! Every decoder must reject hostile bytes with a `ParseError`, never a
//! panic. The samples here are deterministic mutations of valid
//! encodings: truncations at every length, byte flips at every position,
//! and headers whose length fields overrun the surrounding buffer.

use btq_ondisk::{
    BlockGroupItem, Chunk, DevExtent, DevItem, DirItem, DiskKey, InodeRef, RootRef, SearchHeader,
    SearchKey, SpaceArgs, SpaceInfo, Stripe, VolArgs, parse_dir_entries, parse_search_buffer,
};
use btq_types::ParseError;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    invalid_field: u32,
    integer_conversion: u32,
}

impl ErrorCoverage {
    fn observe(&mut self, err: &ParseError) {
        match err {
            ParseError::InsufficientData { .. } => self.insufficient_data += 1,
            ParseError::InvalidField { .. } => self.invalid_field += 1,
            ParseError::IntegerConversion { .. } => self.integer_conversion += 1,
        }
    }
}

/// Run one decoder over one sample, tallying outcomes. Panicking is the
/// only failure; both `Ok` and `Err(ParseError)` are acceptable.
fn run_parser<T, F>(
    sample_name: &str,
    parser_name: &'static str,
    parser_hits: &mut BTreeMap<&'static str, u32>,
    coverage: &mut ErrorCoverage,
    parser: F,
) where
    F: FnOnce() -> Result<T, ParseError>,
{
    *parser_hits.entry(parser_name).or_default() += 1;
    match catch_unwind(AssertUnwindSafe(parser)) {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => coverage.observe(&err),
        Err(_) => panic!("decoder `{parser_name}` panicked on sample `{sample_name}`"),
    }
}

/// One valid encoding per record kind, used as the mutation seed.
fn seed_samples() -> Vec<(&'static str, Vec<u8>)> {
    let key = SearchKey::for_tree(1)
        .objectid_range(256, u64::MAX)
        .item_type_range(0, 255)
        .offset_range(0, u64::MAX);

    let chunk = Chunk {
        length: 1 << 30,
        owner: 2,
        stripe_len: 65536,
        chunk_type: 0x11,
        io_align: 4096,
        io_width: 4096,
        sector_size: 4096,
        num_stripes: 2,
        sub_stripes: 0,
        stripes: vec![
            Stripe {
                devid: 1,
                offset: 0x10_0000,
                dev_uuid: [1; 16],
            },
            Stripe {
                devid: 2,
                offset: 0x20_0000,
                dev_uuid: [2; 16],
            },
        ],
    };

    let dir_item = DirItem {
        location: DiskKey {
            objectid: 257,
            item_type: 132,
            offset: u64::MAX,
        },
        transid: 9,
        data_len: 0,
        name_len: 0,
        entry_type: 2,
    };

    vec![
        (
            "search_key",
            key.to_bytes().expect("valid key encodes").to_vec(),
        ),
        (
            "search_header",
            SearchHeader {
                transid: 3,
                objectid: 257,
                offset: 5,
                item_type: 144,
                len: 8,
            }
            .to_bytes()
            .to_vec(),
        ),
        (
            "space_args",
            SpaceArgs {
                space_slots: 4,
                total_spaces: 4,
            }
            .to_bytes()
            .to_vec(),
        ),
        (
            "space_info",
            SpaceInfo {
                flags: 1,
                total_bytes: 10 << 30,
                used_bytes: 4 << 30,
            }
            .to_bytes()
            .to_vec(),
        ),
        (
            "vol_args",
            VolArgs {
                fd: 7,
                name: "snap".into(),
            }
            .to_bytes()
            .expect("valid vol args encode")
            .to_vec(),
        ),
        (
            "dev_item",
            DevItem {
                devid: 1,
                total_bytes: 500 << 30,
                bytes_used: 1 << 30,
                io_align: 4096,
                io_width: 4096,
                sector_size: 4096,
                dev_type: 0,
                generation: 7,
                start_offset: 0,
                dev_group: 0,
                seek_speed: 0,
                bandwidth: 0,
                uuid: [0xAA; 16],
                fsid: [0xBB; 16],
            }
            .to_bytes()
            .to_vec(),
        ),
        (
            "dev_extent",
            DevExtent {
                chunk_tree: 3,
                chunk_objectid: 256,
                chunk_offset: 32 << 30,
                length: 1 << 30,
                chunk_tree_uuid: [3; 16],
            }
            .to_bytes()
            .to_vec(),
        ),
        ("chunk", chunk.to_bytes()),
        (
            "block_group_item",
            BlockGroupItem {
                used: 4 << 30,
                chunk_objectid: 256,
                flags: 1,
            }
            .to_bytes()
            .to_vec(),
        ),
        (
            "root_ref",
            RootRef {
                dirid: 256,
                sequence: 2,
                name_len: 0,
            }
            .to_bytes_with_name(b"home")
            .expect("valid root ref encodes"),
        ),
        (
            "inode_ref",
            InodeRef {
                index: 2,
                name_len: 0,
            }
            .to_bytes_with_name(b"user")
            .expect("valid inode ref encodes"),
        ),
        (
            "dir_item",
            dir_item
                .to_bytes_with_name(b"default")
                .expect("valid dir item encodes"),
        ),
    ]
}

/// Truncations at every prefix length plus a byte flip at every position.
fn mutations(seed: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for len in 0..seed.len() {
        out.push(seed[..len].to_vec());
    }
    for pos in 0..seed.len() {
        let mut flipped = seed.to_vec();
        flipped[pos] ^= 0xFF;
        out.push(flipped);
    }
    out
}

fn decode_all(
    sample_name: &str,
    data: &[u8],
    hits: &mut BTreeMap<&'static str, u32>,
    coverage: &mut ErrorCoverage,
) {
    run_parser(sample_name, "search_key", hits, coverage, || {
        SearchKey::parse(data)
    });
    run_parser(sample_name, "search_header", hits, coverage, || {
        SearchHeader::parse(data)
    });
    run_parser(sample_name, "space_args", hits, coverage, || {
        SpaceArgs::parse(data)
    });
    run_parser(sample_name, "space_info", hits, coverage, || {
        SpaceInfo::parse(data)
    });
    run_parser(sample_name, "vol_args", hits, coverage, || {
        VolArgs::parse(data)
    });
    run_parser(sample_name, "disk_key", hits, coverage, || {
        DiskKey::parse(data)
    });
    run_parser(sample_name, "dev_item", hits, coverage, || {
        DevItem::parse(data)
    });
    run_parser(sample_name, "dev_extent", hits, coverage, || {
        DevExtent::parse(data)
    });
    run_parser(sample_name, "chunk", hits, coverage, || Chunk::parse(data));
    run_parser(sample_name, "block_group_item", hits, coverage, || {
        BlockGroupItem::parse(data)
    });
    run_parser(sample_name, "root_ref", hits, coverage, || {
        RootRef::parse_with_name(data)
    });
    run_parser(sample_name, "inode_ref", hits, coverage, || {
        InodeRef::parse_with_name(data)
    });
    run_parser(sample_name, "dir_item", hits, coverage, || {
        DirItem::parse(data)
    });
    run_parser(sample_name, "dir_entries", hits, coverage, || {
        parse_dir_entries(data)
    });
}

#[test]
fn no_decoder_panics_on_mutated_input() {
    let mut hits = BTreeMap::new();
    let mut coverage = ErrorCoverage::default();
    let mut total = 0_usize;

    for (kind, seed) in seed_samples() {
        for (index, sample) in mutations(&seed).iter().enumerate() {
            let name = format!("{kind}/{index}");
            decode_all(&name, sample, &mut hits, &mut coverage);
            total += 1;
        }
    }

    assert!(total > 1000, "mutation corpus unexpectedly small: {total}");
    assert!(
        coverage.insufficient_data > 0,
        "no truncation was ever rejected: {coverage:?}"
    );
    assert_eq!(hits.len(), 14, "a decoder never ran: {hits:?}");
}

#[test]
fn search_buffer_walk_rejects_lying_counts() {
    let mut coverage = ErrorCoverage::default();
    let mut hits = BTreeMap::new();

    let header = SearchHeader {
        transid: 1,
        objectid: 257,
        offset: 0,
        item_type: 144,
        len: 4,
    };
    let mut buf = header.to_bytes().to_vec();
    buf.extend_from_slice(&[1, 2, 3, 4]);

    // The honest count decodes.
    assert_eq!(parse_search_buffer(&buf, 1).expect("one item").len(), 1);

    // Counts past the data, payload lengths past the buffer, and every
    // truncation of the buffer fail without panicking.
    for count in [2_u32, 100, u32::MAX] {
        run_parser("count_lie", "search_buffer", &mut hits, &mut coverage, || {
            parse_search_buffer(&buf, count)
        });
    }
    for sample in mutations(&buf) {
        run_parser(
            "buffer_mutation",
            "search_buffer",
            &mut hits,
            &mut coverage,
            || parse_search_buffer(&sample, 1),
        );
    }

    assert!(coverage.insufficient_data > 0, "{coverage:?}");
}

#[test]
fn chunk_stripe_count_cannot_overrun() {
    // A chunk head claiming far more stripes than the payload carries.
    let chunk = Chunk {
        length: 1 << 30,
        owner: 2,
        stripe_len: 65536,
        chunk_type: 1,
        io_align: 4096,
        io_width: 4096,
        sector_size: 4096,
        num_stripes: 1,
        sub_stripes: 0,
        stripes: vec![Stripe {
            devid: 1,
            offset: 0,
            dev_uuid: [0; 16],
        }],
    };
    let mut bytes = chunk.to_bytes();
    bytes[44..46].copy_from_slice(&u16::MAX.to_le_bytes());

    match Chunk::parse(&bytes) {
        Err(ParseError::InsufficientData { .. }) => {}
        other => panic!("expected truncation error, got {other:?}"),
    }
}

#[test]
fn name_lengths_are_bounded_by_the_payload() {
    // Each name-carrying record claiming a name longer than its payload.
    let root = RootRef {
        dirid: 256,
        sequence: 0,
        name_len: u16::MAX,
    };
    assert!(matches!(
        RootRef::parse_with_name(&root.to_bytes()),
        Err(ParseError::InsufficientData { .. })
    ));

    let inode = InodeRef {
        index: 0,
        name_len: 300,
    };
    assert!(matches!(
        InodeRef::parse_with_name(&inode.to_bytes()),
        Err(ParseError::InsufficientData { .. })
    ));

    let dir = DirItem {
        location: DiskKey {
            objectid: 1,
            item_type: 84,
            offset: 0,
        },
        transid: 1,
        data_len: 0,
        name_len: 4096,
        entry_type: 0,
    };
    assert!(parse_dir_entries(&dir.to_bytes()).is_err());
}
