#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

const FACTS: &str = "\
account,campaign,day,clicks,cost
acme,spring,2024-01-01,10,1.5
acme,spring,2024-01-02,5,0.5
acme,summer,2024-01-01,3,2
globex,spring,2024-01-03,7,1
initech,fall,2024-01-02,1,0.25
";

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let csv = dir.path().join("facts.csv");
    fs::write(&csv, FACTS).expect("write facts");
    (dir, csv)
}

fn strata(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("strata");
    cmd.env("XDG_CONFIG_HOME", dir)
        .env("HOME", dir)
        .env_remove("STRATA_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

fn explore_json(dir: &Path, args: &[&str]) -> Value {
    let output = strata(dir)
        .args(["--format", "json", "explore"])
        .args(args)
        .output()
        .expect("run strata");
    assert!(
        output.status.success(),
        "strata failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json output")
}

fn children(node: &Value) -> &Vec<Value> {
    node["children"]["nodes"].as_array().expect("children")
}

fn ids(node: &Value) -> Vec<&str> {
    children(node)
        .iter()
        .map(|child| child["breakdown_id"].as_str().expect("id"))
        .collect()
}

fn find<'a>(node: &'a Value, id: &str) -> Option<&'a Value> {
    if node["breakdown_id"] == id {
        return Some(node);
    }
    node["children"]["nodes"]
        .as_array()
        .and_then(|nodes| nodes.iter().find_map(|child| find(child, id)))
}

#[test]
fn explore_prints_tree_with_totals_and_pages() {
    let (dir, csv) = setup();
    let output = strata(dir.path())
        .args(["explore", csv.to_str().unwrap(), "--metrics", "clicks,cost"])
        .args(["--path", "account,campaign"])
        .output()
        .expect("run strata");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("utf8");

    assert!(stdout.contains("Breakdown account > campaign"), "{stdout}");
    assert!(stdout.contains("Total  clicks=26 cost=5.25  [3/3]"), "{stdout}");
    assert!(stdout.contains("acme  clicks=18 cost=4  [2/2]"), "{stdout}");
    assert!(stdout.contains("acme/spring  clicks=15 cost=2"), "{stdout}");
    assert!(stdout.contains("initech/fall"), "{stdout}");
    assert!(stdout.contains("fetch calls: 2"), "{stdout}");
}

#[test]
fn explore_json_batches_one_request_per_level() {
    let (dir, csv) = setup();
    let report = explore_json(
        dir.path(),
        &[csv.to_str().unwrap(), "--metrics", "clicks,cost", "--path", "account,campaign,day"],
    );

    assert_eq!(report["requests"], 3);
    assert_eq!(report["path"], serde_json::json!(["account", "campaign", "day"]));
    let tree = &report["tree"];
    assert_eq!(tree["stats"]["clicks"]["value"], 26);
    assert_eq!(ids(tree), vec!["acme", "globex", "initech"]);
    assert_eq!(tree["children"]["pagination"]["count"], 3);
    assert_eq!(tree["children"]["pagination"]["complete"], true);

    let spring = find(tree, "acme/spring").expect("acme/spring");
    assert_eq!(ids(spring), vec!["acme/spring/2024-01-01", "acme/spring/2024-01-02"]);
    let leaf = find(tree, "acme/spring/2024-01-02").expect("leaf");
    assert!(leaf["children"].is_null());
    assert_eq!(leaf["stats"]["clicks"]["value"], 5);
}

#[test]
fn order_sorts_rows_by_metric() {
    let (dir, csv) = setup();
    let report = explore_json(
        dir.path(),
        &[csv.to_str().unwrap(), "--metrics", "clicks", "--path", "account", "--order", "-clicks"],
    );
    assert_eq!(ids(&report["tree"]), vec!["acme", "globex", "initech"]);

    let report = explore_json(
        dir.path(),
        &[csv.to_str().unwrap(), "--metrics", "clicks", "--path", "account", "--order", "clicks"],
    );
    assert_eq!(ids(&report["tree"]), vec!["initech", "globex", "acme"]);
}

#[test]
fn unknown_counts_settle_after_loading_more() {
    let (dir, csv) = setup();
    let report = explore_json(
        dir.path(),
        &[
            csv.to_str().unwrap(),
            "--metrics",
            "clicks",
            "--unknown-counts",
            "--path",
            "account,campaign",
            "--page-size",
            "2",
            "--more",
            ".",
        ],
    );

    let tree = &report["tree"];
    assert_eq!(ids(tree), vec!["acme", "globex", "initech"]);
    let pagination = &tree["children"]["pagination"];
    assert_eq!(pagination["limit"], 3);
    assert_eq!(pagination["count"], 3);
    assert_eq!(pagination["complete"], true);
    // Two levels for the first page, two more for the appended row.
    assert_eq!(report["requests"], 4);
    assert_eq!(ids(find(tree, "initech").expect("initech")), vec!["initech/fall"]);
}

#[test]
fn reconfigure_refetches_only_the_changed_level() {
    let (dir, csv) = setup();
    let report = explore_json(
        dir.path(),
        &[
            csv.to_str().unwrap(),
            "--metrics",
            "clicks",
            "--path",
            "account,campaign",
            "--reconfigure",
            "account,day",
        ],
    );

    assert_eq!(report["path"], serde_json::json!(["account", "day"]));
    assert_eq!(report["requests"], 3);
    let tree = &report["tree"];
    assert_eq!(ids(tree), vec!["acme", "globex", "initech"]);
    let acme = find(tree, "acme").expect("acme");
    assert_eq!(ids(acme), vec!["acme/2024-01-01", "acme/2024-01-02"]);
    assert!(find(tree, "acme/spring").is_none());
}

#[test]
fn filters_and_date_range_narrow_the_facts() {
    let (dir, csv) = setup();
    let report = explore_json(
        dir.path(),
        &[
            csv.to_str().unwrap(),
            "--metrics",
            "clicks",
            "--path",
            "account",
            "--filter",
            "campaign=spring",
        ],
    );
    assert_eq!(ids(&report["tree"]), vec!["acme", "globex"]);
    assert_eq!(report["tree"]["stats"]["clicks"]["value"], 22);

    let report = explore_json(
        dir.path(),
        &[
            csv.to_str().unwrap(),
            "--metrics",
            "clicks",
            "--path",
            "account",
            "--date-column",
            "day",
            "--from",
            "2024-01-02",
            "--to",
            "2024-01-03",
        ],
    );
    assert_eq!(report["tree"]["stats"]["clicks"]["value"], 13);
    assert_eq!(find(&report["tree"], "acme").expect("acme")["stats"]["clicks"]["value"], 5);
}

#[test]
fn edit_updates_an_editable_cell() {
    let (dir, csv) = setup();
    let report = explore_json(
        dir.path(),
        &[
            csv.to_str().unwrap(),
            "--metrics",
            "clicks,cost",
            "--editable",
            "clicks",
            "--path",
            "account,campaign",
            "--edit",
            "acme/spring:clicks=99",
        ],
    );

    let spring = find(&report["tree"], "acme/spring").expect("acme/spring");
    assert_eq!(spring["stats"]["clicks"]["value"], 99);
    assert_eq!(spring["stats"]["clicks"]["isEditable"], true);
    assert_eq!(spring["stats"]["cost"]["value"], 2);
}

#[test]
fn edit_of_read_only_cell_fails() {
    let (dir, csv) = setup();
    let output = strata(dir.path())
        .args(["explore", csv.to_str().unwrap(), "--metrics", "clicks,cost"])
        .args(["--editable", "clicks", "--path", "account", "--edit", "acme:cost=1"])
        .output()
        .expect("run strata");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("read-only"), "{stderr}");
}

#[test]
fn unknown_dimension_is_rejected() {
    let (dir, csv) = setup();
    let output = strata(dir.path())
        .args(["explore", csv.to_str().unwrap(), "--metrics", "clicks"])
        .args(["--path", "account,region"])
        .output()
        .expect("run strata");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dataset has no column(s) region"), "{stderr}");
}

#[test]
fn duplicate_dimension_is_a_usage_error() {
    let (dir, csv) = setup();
    strata(dir.path())
        .args(["explore", csv.to_str().unwrap(), "--metrics", "clicks"])
        .args(["--path", "account,account"])
        .assert()
        .failure();
}

#[test]
fn columns_lists_dimensions_and_metrics() {
    let (dir, csv) = setup();
    let output = strata(dir.path())
        .args(["columns", csv.to_str().unwrap(), "--metrics", "clicks,cost", "--editable", "cost"])
        .output()
        .expect("run strata");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("utf8");
    assert!(stdout.contains("Breakdown groups"), "{stdout}");
    assert!(stdout.contains("account: dimension"), "{stdout}");
    assert!(stdout.contains("clicks: read-only"), "{stdout}");
    assert!(stdout.contains("cost: editable"), "{stdout}");

    let output = strata(dir.path())
        .args(["--format", "json", "columns", csv.to_str().unwrap(), "--metrics", "clicks"])
        .output()
        .expect("run strata");
    let meta: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(meta["breakdownGroups"], serde_json::json!(["account", "campaign", "day"]));
}

#[test]
fn config_file_supplies_defaults() {
    let (dir, csv) = setup();
    let config = dir.path().join("strata.toml");
    fs::write(
        &config,
        "[explore]\npage_size = 1\norder = \"-clicks\"\nformat = \"json\"\n",
    )
    .expect("write config");

    let output = strata(dir.path())
        .args(["--config", config.to_str().unwrap()])
        .args(["explore", csv.to_str().unwrap(), "--metrics", "clicks", "--path", "account"])
        .output()
        .expect("run strata");
    assert!(output.status.success());
    let report: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(ids(&report["tree"]), vec!["acme"]);
    assert_eq!(report["tree"]["children"]["pagination"]["count"], 3);
    assert_eq!(report["tree"]["children"]["pagination"]["complete"], false);
}

#[test]
fn missing_explicit_config_is_an_error() {
    let (dir, csv) = setup();
    strata(dir.path())
        .args(["--config", dir.path().join("absent.toml").to_str().unwrap()])
        .args(["explore", csv.to_str().unwrap(), "--metrics", "clicks", "--path", "account"])
        .assert()
        .failure();
}
