//! Integration tests for the embfile library.
//!
//! These tests go through the public API only: files are created through the
//! registry, reopened by extension and read back.

use embfile::{
    build_matrix, BuildMatrixOptions, Compression, CreateOptions, DType, EmbFile, EmbFileExt,
    Error, FormatRegistry, OpenOptions, RowAssignment, TextEncoding, WordVector,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Words whose UTF-16/32 encodings contain the bytes of an ASCII space or newline.
const TRICKY_WORDS: [&str; 5] = ["the", "Ġx", "ਊ", "日本", "café"];

/// Values that survive every dtype and the text format's 5 decimals unchanged.
fn vector_for(i: usize) -> Vec<f32> {
    let base = [0.5f32, -1.25, 2.0, 0.125, -3.0];
    base.iter().map(|v| v + i as f32).collect()
}

fn pairs_for(words: &[&str]) -> Vec<WordVector> {
    words
        .iter()
        .enumerate()
        .map(|(i, w)| WordVector::new(*w, vector_for(i)))
        .collect()
}

fn create(
    dir: &Path,
    format_id: &str,
    pairs: &[WordVector],
    options: &CreateOptions,
) -> PathBuf {
    let registry = FormatRegistry::default();
    let spec = registry.resolve_by_id(format_id).unwrap();
    let mut name = format!("emb{}", spec.default_extension);
    if let Some(compression) = options.compression {
        name.push_str(compression.extension());
    }
    let path = dir.join(name);
    let mut iter = pairs.iter().cloned().map(Ok::<_, Error>);
    registry.create(format_id, &path, &mut iter, options).unwrap();
    path
}

#[test]
fn test_round_trip_across_formats() {
    let compressions = [
        None,
        Some(Compression::Gzip),
        Some(Compression::Bzip2),
        Some(Compression::Xz),
        Some(Compression::Zip),
    ];
    let encodings = [
        TextEncoding::Utf8,
        TextEncoding::Utf16Le,
        TextEncoding::Utf16Be,
        TextEncoding::Utf32Le,
        TextEncoding::Utf32Be,
    ];
    let dtypes = [DType::F32, "<f2".parse().unwrap(), ">f8".parse().unwrap()];
    let pairs = pairs_for(&TRICKY_WORDS);

    let mut case = 0;
    for format_id in ["txt", "bin", "vvm"] {
        for compression in compressions {
            let tmp = TempDir::new().unwrap();
            let encoding = encodings[case % encodings.len()];
            let dtype = dtypes[case % dtypes.len()];
            case += 1;

            let mut options = CreateOptions::new().with_encoding(encoding).with_dtype(dtype);
            options.compression = compression;
            let path = create(tmp.path(), format_id, &pairs, &options);

            let open_options = OpenOptions::new().with_encoding(encoding).with_dtype(dtype);
            let mut file = embfile::open_with(&path, None, &open_options).unwrap();
            let context = format!("{} {:?} {} {}", format_id, compression, encoding.name(), dtype);
            assert_eq!(file.format_id(), format_id, "{}", context);
            assert_eq!(file.vector_size(), 5, "{}", context);
            assert_eq!(file.to_list().unwrap(), pairs, "{}", context);
            if format_id != "txt" {
                assert_eq!(file.vocab_size(), Some(pairs.len()), "{}", context);
            }
            file.close();
        }
    }
}

#[test]
fn test_latin1_text_and_binary() {
    let pairs = pairs_for(&["caf\u{e9}", "na\u{ef}ve", "plain"]);
    for format_id in ["txt", "bin"] {
        let tmp = TempDir::new().unwrap();
        let options = CreateOptions::new().with_encoding(TextEncoding::Latin1);
        let path = create(tmp.path(), format_id, &pairs, &options);
        let open_options = OpenOptions::new().with_encoding(TextEncoding::Latin1);
        let mut file = embfile::open_with(&path, None, &open_options).unwrap();
        assert_eq!(file.to_list().unwrap(), pairs);
    }
}

#[test]
fn test_copy_between_formats() {
    let tmp = TempDir::new().unwrap();
    let pairs = pairs_for(&["a", "b", "c"]);
    let source_path = create(
        tmp.path(),
        "txt",
        &pairs,
        &CreateOptions::new().with_compression(Compression::Gzip),
    );
    let registry = FormatRegistry::default();
    let mut source = embfile::open(&source_path).unwrap();

    let vvm_path = registry
        .copy_file(source.as_mut(), "vvm", None, None, &CreateOptions::new())
        .unwrap();
    assert_eq!(vvm_path, tmp.path().join("emb.vvm"));
    let bin_path = registry
        .copy_file(source.as_mut(), "bin", None, Some("copy.bin"), &CreateOptions::new())
        .unwrap();

    for path in [vvm_path, bin_path] {
        let mut copy = embfile::open(&path).unwrap();
        assert_eq!(copy.to_list().unwrap(), pairs);
    }
}

#[test]
fn test_closing_the_file_closes_readers_and_loaders() {
    for format_id in ["txt", "bin", "vvm"] {
        let tmp = TempDir::new().unwrap();
        let path = create(tmp.path(), format_id, &pairs_for(&["a", "b"]), &CreateOptions::new());
        let mut file = embfile::open(&path).unwrap();

        let mut reader = file.reader().unwrap();
        assert_eq!(reader.next_word().unwrap().as_deref(), Some("a"));
        let words: HashSet<String> = ["b".to_string()].into_iter().collect();
        let mut loader = file.loader(words, true).unwrap();

        file.close();
        assert!(file.is_closed());
        assert!(reader.is_closed());
        assert!(matches!(reader.next_word(), Err(Error::IllegalState(_))));
        assert!(matches!(loader.next(), Some(Err(Error::IllegalState(_)))));
        assert!(matches!(file.reader(), Err(Error::IllegalState(_))));
        assert!(matches!(file.find(["a"]), Err(Error::IllegalState(_))));

        // Closing twice is harmless
        file.close();
    }
}

#[test]
fn test_closing_the_file_drops_cached_vectors() {
    for format_id in ["txt", "bin", "vvm"] {
        let tmp = TempDir::new().unwrap();
        let path = create(tmp.path(), format_id, &pairs_for(&["a", "b"]), &CreateOptions::new());
        let mut file = embfile::open(&path).unwrap();

        let mut reader = file.reader().unwrap();
        reader.next_word().unwrap();
        assert!(reader.current_vector().is_ok());
        file.close();
        assert!(matches!(reader.current_vector(), Err(Error::IllegalState(_))));
    }
}

#[test]
fn test_bad_binary_word_is_not_skipped_past() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bad.bin");
    let mut data = b"3 1\n".to_vec();
    for word in [&b"a"[..], &b"b\xFF"[..], &b"c"[..]] {
        data.extend_from_slice(word);
        data.push(b' ');
        data.extend_from_slice(&2.0f32.to_le_bytes());
    }
    std::fs::write(&path, data).unwrap();

    let mut file = embfile::open(&path).unwrap();
    let mut reader = file.reader().unwrap();
    assert_eq!(reader.next_word().unwrap().as_deref(), Some("a"));
    assert!(matches!(reader.next_word(), Err(Error::BadFile(_))));
    // Retrying reports the same record instead of reading from a shifted offset
    assert!(matches!(reader.next_word(), Err(Error::BadFile(_))));
}

#[test]
fn test_reader_skip_and_reset() {
    for format_id in ["txt", "bin", "vvm"] {
        let tmp = TempDir::new().unwrap();
        let pairs = pairs_for(&["a", "b", "c"]);
        let path = create(tmp.path(), format_id, &pairs, &CreateOptions::new());
        let mut file = embfile::open(&path).unwrap();
        let mut reader = file.reader().unwrap();

        // Skipping vectors doesn't change the sequence of words
        let mut words = Vec::new();
        while let Some(word) = reader.next_word().unwrap() {
            words.push(word);
        }
        assert_eq!(words, ["a", "b", "c"]);
        assert_eq!(reader.next_word().unwrap(), None);

        reader.reset().unwrap();
        assert_eq!(reader.next_word().unwrap().as_deref(), Some("a"));
        assert_eq!(reader.next_word().unwrap().as_deref(), Some("b"));
        assert_eq!(reader.current_vector().unwrap(), pairs[1].vector.as_slice());
        // Cached until the reader advances
        assert_eq!(reader.current_vector().unwrap(), pairs[1].vector.as_slice());
        assert_eq!(reader.next_word().unwrap().as_deref(), Some("c"));
    }
}

#[test]
fn test_find_and_load() {
    for format_id in ["txt", "bin", "vvm"] {
        let tmp = TempDir::new().unwrap();
        let pairs = pairs_for(&TRICKY_WORDS);
        let path = create(tmp.path(), format_id, &pairs, &CreateOptions::new());
        let mut file = embfile::open(&path).unwrap();

        let found = file.find(["日本", "nope", "the", "nada"]).unwrap();
        let found_words: HashSet<&str> = found.word2vec.keys().map(String::as_str).collect();
        assert_eq!(found_words, ["日本", "the"].into_iter().collect());
        assert_eq!(found.word2vec["日本"], pairs[3].vector);
        let missing: HashSet<String> = ["nope", "nada"].iter().map(|w| w.to_string()).collect();
        assert_eq!(found.missing_words, missing);

        let none = file.find(Vec::<String>::new()).unwrap();
        assert!(none.word2vec.is_empty() && none.missing_words.is_empty());
        let all_missing = file.find(["x", "y"]).unwrap();
        assert!(all_missing.word2vec.is_empty());
        assert_eq!(all_missing.missing_words.len(), 2);

        let loaded = file.load(["Ġx", "ਊ"]).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["ਊ"], pairs[2].vector);
        match file.load(["the", "nope"]) {
            Err(Error::KeyNotFound { count, sample }) => {
                assert_eq!(count, 1);
                assert_eq!(sample, vec!["nope".to_string()]);
            }
            other => panic!("expected KeyNotFound, got {:?}", other.map(|m| m.len())),
        }
    }
}

#[test]
fn test_filter_and_maps() {
    let tmp = TempDir::new().unwrap();
    let pairs = pairs_for(&["apple", "banana", "avocado"]);
    let path = create(tmp.path(), "bin", &pairs, &CreateOptions::new());
    let mut file = embfile::open(&path).unwrap();

    let filtered: Vec<WordVector> = file
        .filter(|word| word.starts_with('a'))
        .unwrap()
        .collect::<embfile::Result<_>>()
        .unwrap();
    assert_eq!(filtered, vec![pairs[0].clone(), pairs[2].clone()]);

    let map = file.to_map().unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(map["banana"], pairs[1].vector);

    let words: Vec<String> = file.words().unwrap().collect::<embfile::Result<_>>().unwrap();
    assert_eq!(words, ["apple", "banana", "avocado"]);
}

#[test]
fn test_save_vocab() {
    let tmp = TempDir::new().unwrap();
    let path = create(tmp.path(), "vvm", &pairs_for(&["a", "b"]), &CreateOptions::new());
    let mut file = embfile::open(&path).unwrap();
    let vocab_path = file.save_vocab(None, TextEncoding::Utf8, false).unwrap();
    assert_eq!(vocab_path, tmp.path().join("emb_vocab.txt"));
    assert_eq!(std::fs::read_to_string(&vocab_path).unwrap(), "a\nb\n");
    assert!(matches!(
        file.save_vocab(None, TextEncoding::Utf8, false),
        Err(Error::FileAlreadyExists(_))
    ));
}

#[test]
fn test_extension_resolution() {
    let registry = FormatRegistry::default();
    assert_eq!(registry.resolve_path(Path::new("file.txt.gz")).unwrap().id, "txt");
    assert_eq!(registry.resolve_path(Path::new("glove.vec")).unwrap().id, "txt");
    assert_eq!(registry.resolve_path(Path::new("w2v.bin.bz2")).unwrap().id, "bin");
    match registry.resolve_path(Path::new("file.xyz")) {
        Err(Error::Argument(message)) => {
            for ext in [".bin", ".txt", ".vec", ".vvm"] {
                assert!(message.contains(ext), "{}", message);
            }
        }
        other => panic!("expected an argument error, got {:?}", other.map(|s| s.id)),
    }
}

#[test]
fn test_create_refuses_to_overwrite() {
    let tmp = TempDir::new().unwrap();
    let pairs = pairs_for(&["a"]);
    let path = create(tmp.path(), "txt", &pairs, &CreateOptions::new());
    let registry = FormatRegistry::default();
    let mut iter = pairs.iter().cloned().map(Ok::<_, Error>);
    let err = registry
        .create("txt", &path, &mut iter, &CreateOptions::new())
        .unwrap_err();
    assert!(matches!(err, Error::FileAlreadyExists(_)));

    let replacement = pairs_for(&["z"]);
    let mut iter = replacement.iter().cloned().map(Ok::<_, Error>);
    registry
        .create("txt", &path, &mut iter, &CreateOptions::new().with_overwrite(true))
        .unwrap();
    assert_eq!(embfile::open(&path).unwrap().to_list().unwrap(), replacement);
}

#[test]
fn test_build_matrix_from_vvm() {
    let tmp = TempDir::new().unwrap();
    let pairs = pairs_for(&["a", "b", "c", "d"]);
    let path = create(tmp.path(), "vvm", &pairs, &CreateOptions::new());
    let mut file = embfile::open(&path).unwrap();

    let output = build_matrix(
        file.as_mut(),
        RowAssignment::words_from(["d", "zz", "a"], 1),
        BuildMatrixOptions::default().without_initializer(),
    )
    .unwrap();
    assert_eq!(output.matrix.dim(), (4, 5));
    assert_eq!(output.vector("d").unwrap().to_vec(), pairs[3].vector);
    assert_eq!(output.vector("a").unwrap().to_vec(), pairs[0].vector);
    assert!(output.vector("zz").unwrap().iter().all(|&v| v == 0.0));
    assert!(output.missing_words.contains("zz"));
}
