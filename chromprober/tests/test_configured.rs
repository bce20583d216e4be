use std::fs;

use clap::CommandFactory;
use figment::{
    providers::{Format, Toml},
    Figment,
};

use chromprobe::SearchMode;
use chromprober::{ArgSearchMode, ChromProber};

#[test_log::test]
fn test_extract_config() {
    let config = Figment::new().merge(Toml::string(
        r#"
input_file = "run.mzML"
threads = 2

[params]
chrom_smooth_range = 0.2
search_mode = "Deep"

[[targets]]
mz = 512.3
charge = 2
abundance_ratios = [1.0, 0.6, 0.2]
retention_time = 31.5
"#,
    ));
    let driver: ChromProber = config.extract().unwrap();
    assert_eq!(driver.input_file, "run.mzML");
    assert_eq!(driver.threads, 2);
    assert_eq!(driver.output_file.to_str(), Some("-"));
    assert_eq!(driver.params.chrom_smooth_range, 0.2);
    assert_eq!(driver.detection_params().search_mode, SearchMode::Deep);

    let targets = driver.analyte_targets().unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].charge, 2);
    assert_eq!(targets[0].ms_level, 1);
    assert_eq!(targets[0].retention_time, Some(31.5));
    assert_eq!(targets[0].abundance_ratios.len(), 3);
}

#[test]
fn test_arguments_override_config_file() {
    let dir = std::env::temp_dir().join(format!("chromprober-config-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("params.toml");
    fs::write(
        &path,
        "threads = 3\ncharge = 2\n\n[params]\nmax_candidates = 7\nsearch_mode = \"Deep\"\n",
    )
    .unwrap();

    let matches = ChromProber::command()
        .try_get_matches_from([
            "chromprober",
            "in.mzML",
            "--config-file",
            path.to_str().unwrap(),
            "--charge",
            "3",
            "-m",
            "450.2@10",
            "-s",
            "greedy",
        ])
        .unwrap();
    let driver = ChromProber::from_matches(&matches).unwrap();
    assert_eq!(driver.threads, 3);
    assert_eq!(driver.charge, 3);
    assert_eq!(driver.params.max_candidates, 7);
    assert_eq!(driver.search_mode, Some(ArgSearchMode::Greedy));
    assert_eq!(driver.detection_params().search_mode, SearchMode::Greedy);

    let targets = driver.analyte_targets().unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].charge, 3);
    assert_eq!(targets[0].mz, 450.2);
    assert_eq!(targets[0].retention_time, Some(10.0));

    fs::remove_dir_all(&dir).unwrap();
}
