// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::io::Write;

use crate::{Fingerprint, WriterHasher};

#[test]
fn hashes_while_writing() {
    let content = b"meep meep";

    let mut hasher = WriterHasher::new(Vec::new());
    hasher.write_all(content).unwrap();
    let (fingerprint, written) = hasher.finish();

    assert_eq!(written, content);
    assert_eq!(fingerprint, Fingerprint::of_bytes(content));
}

#[test]
fn split_writes_match_one_shot() {
    let mut hasher = WriterHasher::new(Vec::new());
    hasher.write_all(b"meep ").unwrap();
    hasher.write_all(b"meep").unwrap();
    let (fingerprint, _) = hasher.finish();

    assert_eq!(fingerprint, Fingerprint::of_bytes(b"meep meep"));
}
