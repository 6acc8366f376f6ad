use fileflow::compression::Codec;
use fileflow::config::PipelineConfig;
use fileflow::core::FixedMemoryMonitor;
use fileflow::error::{FlowError, EXIT_PARTIAL, EXIT_SUCCESS};
use fileflow::pipeline::Pipeline;
use fileflow::stage::{Decompress, GlobRead, ReadFolder, Unzip, WriteFile};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn zip(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, contents) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn toml_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

#[test]
fn test_glob_unzip_to_file() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("in");
    fs::create_dir(&input).unwrap();
    fs::write(input.join("1.zip"), zip(&[("a.txt", "alpha\n"), ("b.txt", "beta\n")])).unwrap();
    fs::write(input.join("2.zip"), b"corrupt, not an archive").unwrap();
    fs::write(input.join("3.zip"), zip(&[("c.txt", "gamma\n")])).unwrap();
    let output = temp.path().join("out/all.txt");

    let report = Pipeline::new(1)
        .stage(
            GlobRead::new(format!("{}/*.zip", input.display()))
                .monitor(Arc::new(FixedMemoryMonitor(0))),
        )
        .stage(Unzip::new())
        .stage(WriteFile::new(&output))
        .run()
        .unwrap();

    assert_eq!(fs::read_to_string(&output).unwrap(), "alpha\nbeta\ngamma\n");
    assert_eq!(report.stages[0].items_emitted, 3);
    assert_eq!(report.stages[1].items_emitted, 3);
    assert_eq!(report.items_dropped(), 1);
    assert_eq!(report.exit_code(), EXIT_PARTIAL);
}

#[test]
fn test_folder_gunzip_streams_large_files() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("in");
    fs::create_dir_all(input.join("nested")).unwrap();

    let big: String = (0..20_000).map(|i| format!("line {}\n", i)).collect();
    fs::write(input.join("a.gz"), gzip(b"hello world\n")).unwrap();
    fs::write(input.join("nested/b.gz"), gzip(big.as_bytes())).unwrap();
    let output = temp.path().join("result.txt");

    // Threshold low enough that the second archive travels as a stream
    let report = Pipeline::new(1)
        .stage(
            ReadFolder::new(&input)
                .size_threshold(64)
                .chunk_size(512)
                .monitor(Arc::new(FixedMemoryMonitor(0))),
        )
        .stage(Decompress::new(Codec::Gzip).chunk_size(4096))
        .stage(WriteFile::new(&output))
        .run()
        .unwrap();

    let written = fs::read_to_string(&output).unwrap();
    assert_eq!(written, format!("hello world\n{}", big));
    assert_eq!(report.exit_code(), EXIT_SUCCESS);
}

#[test]
fn test_corrupt_gzip_still_closes_normally() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("bad.gz"), b"definitely not gzip").unwrap();
    let output = temp.path().join("out.txt");

    let report = Pipeline::new(1)
        .stage(
            GlobRead::new(format!("{}/*.gz", temp.path().display()))
                .monitor(Arc::new(FixedMemoryMonitor(0))),
        )
        .stage(Decompress::default())
        .stage(WriteFile::new(&output))
        .run()
        .unwrap();

    assert_eq!(report.stages[1].items_emitted, 0);
    assert_eq!(fs::read_to_string(&output).unwrap(), "");
}

#[test]
fn test_missing_folder_fails_pipeline() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("out.txt");

    let err = Pipeline::new(1)
        .stage(ReadFolder::new(temp.path().join("nowhere")))
        .stage(WriteFile::new(&output))
        .run()
        .unwrap_err();

    assert!(matches!(err, FlowError::SourceNotFound(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_config_driven_rewrite_chain() {
    let temp = TempDir::new().unwrap();
    let data = temp.path().join("data");
    fs::create_dir(&data).unwrap();
    fs::write(data.join("names.lst"), "template.txt").unwrap();
    fs::write(data.join("template.txt"), "value is {X}, home is ${FILEFLOW_IT_HOME}\n").unwrap();
    std::env::set_var("FILEFLOW_IT_HOME", "/srv/flow");
    let output = temp.path().join("out/rendered.txt");

    let config = PipelineConfig::from_toml_str(&format!(
        r#"
channel_capacity = 2

[[stages]]
type = "glob_read"
glob = "{data}/*.lst"
text = true

[[stages]]
type = "read_file"
folder_path = "{data}"

[[stages]]
type = "substitute"
source = "{{X}}"
replace = "42"

[[stages]]
type = "envsub"

[[stages]]
type = "write_file"
path = "{out}"
"#,
        data = toml_path(&data),
        out = toml_path(&output),
    ))
    .unwrap();

    let report = Pipeline::from_config(&config).unwrap().run().unwrap();

    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "value is 42, home is /srv/flow\n"
    );
    assert_eq!(report.stages.len(), 5);
}

#[test]
fn test_shape_mismatch_aborts_pipeline() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("x.txt"), "text").unwrap();

    let config = PipelineConfig::from_toml_str(&format!(
        r#"
[[stages]]
type = "glob_read"
glob = "{dir}/*.txt"
text = true

[[stages]]
type = "unzip"

[[stages]]
type = "write_file"
path = "{dir}/out.bin"
"#,
        dir = toml_path(temp.path()),
    ))
    .unwrap();

    let err = Pipeline::from_config(&config).unwrap().run().unwrap_err();
    assert!(matches!(err, FlowError::ShapeMismatch { .. }));
}

#[test]
fn test_sink_appends_across_runs() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("one.txt"), "1").unwrap();
    let output = temp.path().join("out/log.txt");

    for _ in 0..3 {
        Pipeline::new(1)
            .stage(
                GlobRead::new(format!("{}/*.txt", temp.path().display()))
                    .monitor(Arc::new(FixedMemoryMonitor(0))),
            )
            .stage(WriteFile::new(&output))
            .run()
            .unwrap();
    }

    assert_eq!(fs::read_to_string(&output).unwrap(), "111");
}
