//! Workload catalog and experiment suite files.
//!
//! Two XML documents drive a run: the jobs catalog (`<jobs>`) describing each
//! launchable job once, and the experiment suite (`<suite>`) listing the
//! ordered job references that form the initial queue.  The suite can also be
//! written back out, which the `gen` subcommand uses.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::app::Application;

/// One catalog entry: everything needed to instantiate and launch a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    /// Number of task containers (`yn` runner argument).
    pub n_tasks: usize,
    /// Optional task-manager memory (`ytm` runner argument), in MB.
    pub task_memory_mb: Option<u32>,
    /// Optional main class (`c` runner argument).
    pub main_class: Option<String>,
    pub jar: String,
    pub args: Vec<String>,
}

/// The jobs catalog, keyed by job name.
#[derive(Debug, Default)]
pub struct Jobs {
    specs: BTreeMap<String, JobSpec>,
}

impl Jobs {
    pub fn from_xml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open jobs file: {}", path.display()))?;
        Self::from_xml_str(&content)
            .with_context(|| format!("failed to parse jobs file: {}", path.display()))
    }

    pub fn from_xml_str(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut path: Vec<String> = Vec::new();
        let mut specs = BTreeMap::new();

        let mut job: Option<JobBuilder> = None;
        let mut arg_name: Option<String> = None;

        loop {
            match reader.read_event().context("malformed jobs XML")? {
                Event::Start(start) => {
                    let name = element_name(&start)?;
                    if name == "job" {
                        job = Some(JobBuilder::new(required_attr(&start, "name")?));
                    } else if name == "argument" {
                        arg_name = optional_attr(&start, "name")?;
                    }
                    path.push(name);
                }
                Event::Empty(start) => {
                    // An empty <argument name="--flag"/> still contributes its name.
                    if element_name(&start)? == "argument" && in_jar_arguments(&path) {
                        if let (Some(builder), Some(name)) =
                            (job.as_mut(), optional_attr(&start, "name")?)
                        {
                            builder.args.push(name);
                        }
                    }
                }
                Event::Text(text) => {
                    let value = text.unescape().context("malformed jobs XML text")?;
                    if let Some(builder) = job.as_mut() {
                        builder.text(&path, arg_name.as_deref(), value.trim())?;
                    }
                }
                Event::End(_) => {
                    if path.last().map(String::as_str) == Some("argument") {
                        arg_name = None;
                    }
                    if path.pop().as_deref() == Some("job") {
                        let spec = job
                            .take()
                            .ok_or_else(|| anyhow!("unbalanced <job> element"))?
                            .build()?;
                        specs.insert(spec.name.clone(), spec);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self { specs })
    }

    pub fn get(&self, name: &str) -> Option<&JobSpec> {
        self.specs.get(name)
    }

    /// Catalog job names in stable (sorted) order.
    pub fn names(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Collects one `<job>` element while parsing.
struct JobBuilder {
    name: String,
    n_tasks: Option<usize>,
    task_memory_mb: Option<u32>,
    main_class: Option<String>,
    jar: Option<String>,
    args: Vec<String>,
}

impl JobBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            n_tasks: None,
            task_memory_mb: None,
            main_class: None,
            jar: None,
            args: Vec::new(),
        }
    }

    fn text(&mut self, path: &[String], arg_name: Option<&str>, value: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        if in_runner_arguments(path) {
            match arg_name {
                Some("yn") => {
                    self.n_tasks =
                        Some(value.parse().context("runner argument 'yn' is not a number")?)
                }
                Some("ytm") => {
                    self.task_memory_mb =
                        Some(value.parse().context("runner argument 'ytm' is not a number")?)
                }
                Some("c") => self.main_class = Some(value.to_string()),
                _ => {}
            }
        } else if ends_with(path, &["job", "jar", "path"]) {
            self.jar = Some(value.to_string());
        } else if in_jar_arguments(path) {
            let arg = match arg_name {
                Some(name) => format!("{name} {value}"),
                None => value.to_string(),
            };
            self.args.push(arg.trim().to_string());
        }
        Ok(())
    }

    fn build(self) -> Result<JobSpec> {
        let n_tasks = self.n_tasks.ok_or_else(|| {
            anyhow!(
                "job '{}': runner/arguments/argument with name = yn was not found",
                self.name
            )
        })?;
        let jar = self
            .jar
            .ok_or_else(|| anyhow!("job '{}': jar/path was not found", self.name))?;

        Ok(JobSpec {
            name: self.name,
            n_tasks,
            task_memory_mb: self.task_memory_mb,
            main_class: self.main_class,
            jar,
            args: self.args,
        })
    }
}

fn in_runner_arguments(path: &[String]) -> bool {
    ends_with(path, &["job", "runner", "arguments", "argument"])
}

fn in_jar_arguments(path: &[String]) -> bool {
    ends_with(path, &["job", "jar", "arguments", "argument"])
        || ends_with(path, &["job", "jar", "arguments"])
}

fn ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

fn element_name(start: &BytesStart<'_>) -> Result<String> {
    Ok(String::from_utf8_lossy(start.name().as_ref()).into_owned())
}

fn required_attr(start: &BytesStart<'_>, name: &str) -> Result<String> {
    optional_attr(start, name)?
        .ok_or_else(|| anyhow!("element is missing required attribute '{name}'"))
}

fn optional_attr(start: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for attr in start.attributes() {
        let attr = attr.context("malformed XML attribute")?;
        if attr.key.as_ref() == name.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// One ordered reference into the jobs catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentEntry {
    pub job: String,
    pub data_set: Option<String>,
}

/// An ordered list of job references forming the initial queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub name: String,
    pub entries: Vec<ExperimentEntry>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, entries: Vec<ExperimentEntry>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }

    pub fn from_xml_file(path: &Path, jobs: &Jobs) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open experiment file: {}", path.display()))?;
        Self::from_xml_str(&content, jobs)
            .with_context(|| format!("failed to parse experiment file: {}", path.display()))
    }

    pub fn from_xml_str(xml: &str, jobs: &Jobs) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut name = String::from("generated_experiment");
        let mut entries = Vec::new();
        let mut in_experiment = false;

        loop {
            match reader.read_event().context("malformed experiment XML")? {
                Event::Start(start) | Event::Empty(start) => match element_name(&start)?.as_str() {
                    "experiment" => {
                        in_experiment = true;
                        if let Some(n) = optional_attr(&start, "name")? {
                            name = n;
                        }
                    }
                    "job" if in_experiment => {
                        let job = required_attr(&start, "name")?;
                        if jobs.get(&job).is_none() {
                            bail!("experiment references unknown job '{job}'");
                        }
                        let data_set = optional_attr(&start, "dataset")?.filter(|d| !d.is_empty());
                        entries.push(ExperimentEntry { job, data_set });
                    }
                    _ => {}
                },
                Event::End(end) => {
                    if end.name().as_ref() == b"experiment" {
                        in_experiment = false;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self { name, entries })
    }

    /// Render the suite document back to XML.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 3);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))?;
        writer.write_event(Event::Start(BytesStart::new("suite")))?;

        let mut experiment = BytesStart::new("experiment");
        experiment.push_attribute(("name", self.name.as_str()));
        writer.write_event(Event::Start(experiment))?;

        for entry in &self.entries {
            let mut job = BytesStart::new("job");
            job.push_attribute(("name", entry.job.as_str()));
            if let Some(data_set) = &entry.data_set {
                job.push_attribute(("dataset", data_set.as_str()));
            }
            writer.write_event(Event::Start(job))?;
            writer.write_event(Event::Text(BytesText::new("0")))?;
            writer.write_event(Event::End(BytesEnd::new("job")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("experiment")))?;
        writer.write_event(Event::End(BytesEnd::new("suite")))?;

        String::from_utf8(writer.into_inner()).context("experiment XML is not valid UTF-8")
    }

    /// Build the pending applications for this experiment, in order.
    pub fn instantiate(&self, jobs: &Jobs) -> Result<Vec<Arc<Application>>> {
        self.entries
            .iter()
            .map(|entry| {
                let spec = jobs
                    .get(&entry.job)
                    .ok_or_else(|| anyhow!("experiment references unknown job '{}'", entry.job))?;
                Ok(Arc::new(Application::from_spec(spec, entry.data_set.clone())))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOBS: &str = r#"
<jobs>
    <job name="tpch-1-full">
        <runner>
            <name>flink</name>
            <arguments>
                <argument name="m">yarn-cluster</argument>
                <argument name="yn">159</argument>
                <argument name="ytm">2048</argument>
                <argument name="c">org.example.Tpch</argument>
            </arguments>
        </runner>
        <jar>
            <path>/home/test/tests/tpch/test.jar </path>
            <arguments>
                <argument>hdfs:///data/tpch/1T/lineitem.tbl</argument>
                <argument name="--arg2">hdfs:///data/tpch/1T/customer.tbl</argument>
                <argument>hdfs:///user/test/tpch/result</argument>
            </arguments>
        </jar>
    </job>
    <job name="tpch-1">
        <runner>
            <name>flink</name>
            <arguments>
                <argument name="m">yarn-cluster</argument>
                <argument name="yn">70</argument>
                <argument name="yqu">default</argument>
            </arguments>
        </runner>
        <jar>
            <path>/home/test/tests/tpch/test.jar</path>
            <arguments>
            </arguments>
        </jar>
    </job>
</jobs>
"#;

    const SUITE: &str = r#"
<suite>
   <experiment name="tpch-coco">
      <job name="tpch-1-full">0</job>
      <job name="tpch-1" dataset="1T">0</job>
      <job name="tpch-1-full">0</job>
   </experiment>
</suite>
"#;

    #[test]
    fn jobs_catalog_parses_runner_and_jar_blocks() {
        let jobs = Jobs::from_xml_str(JOBS).unwrap();
        assert_eq!(jobs.len(), 2);

        let full = jobs.get("tpch-1-full").unwrap();
        assert_eq!(full.n_tasks, 159);
        assert_eq!(full.task_memory_mb, Some(2048));
        assert_eq!(full.main_class.as_deref(), Some("org.example.Tpch"));
        assert_eq!(full.jar, "/home/test/tests/tpch/test.jar");
        assert_eq!(
            full.args,
            vec![
                "hdfs:///data/tpch/1T/lineitem.tbl",
                "--arg2 hdfs:///data/tpch/1T/customer.tbl",
                "hdfs:///user/test/tpch/result",
            ]
        );

        let small = jobs.get("tpch-1").unwrap();
        assert_eq!(small.n_tasks, 70);
        assert_eq!(small.task_memory_mb, None);
        assert_eq!(small.main_class, None);
        assert!(small.args.is_empty());
    }

    #[test]
    fn job_without_yn_is_rejected() {
        let xml = r#"
<jobs>
    <job name="broken">
        <runner><arguments><argument name="m">yarn-cluster</argument></arguments></runner>
        <jar><path>x.jar</path><arguments></arguments></jar>
    </job>
</jobs>
"#;
        let err = Jobs::from_xml_str(xml).unwrap_err();
        assert!(err.to_string().contains("yn"));
    }

    #[test]
    fn names_are_sorted() {
        let jobs = Jobs::from_xml_str(JOBS).unwrap();
        assert_eq!(jobs.names(), vec!["tpch-1", "tpch-1-full"]);
    }

    #[test]
    fn experiment_keeps_order_and_datasets() {
        let jobs = Jobs::from_xml_str(JOBS).unwrap();
        let exp = Experiment::from_xml_str(SUITE, &jobs).unwrap();

        assert_eq!(exp.name, "tpch-coco");
        assert_eq!(exp.entries.len(), 3);
        assert_eq!(exp.entries[0].job, "tpch-1-full");
        assert_eq!(exp.entries[0].data_set, None);
        assert_eq!(exp.entries[1].job, "tpch-1");
        assert_eq!(exp.entries[1].data_set.as_deref(), Some("1T"));
        assert_eq!(exp.entries[2].job, "tpch-1-full");
    }

    #[test]
    fn experiment_with_unknown_job_is_rejected() {
        let jobs = Jobs::from_xml_str(JOBS).unwrap();
        let xml = r#"<suite><experiment name="x"><job name="nope">0</job></experiment></suite>"#;
        assert!(Experiment::from_xml_str(xml, &jobs).is_err());
    }

    #[test]
    fn xml_round_trip_preserves_the_application_list() {
        let jobs = Jobs::from_xml_str(JOBS).unwrap();
        let exp = Experiment::from_xml_str(SUITE, &jobs).unwrap();

        let rendered = exp.to_xml().unwrap();
        let back = Experiment::from_xml_str(&rendered, &jobs).unwrap();

        assert_eq!(exp, back);
    }

    #[test]
    fn instantiate_builds_one_application_per_entry() {
        let jobs = Jobs::from_xml_str(JOBS).unwrap();
        let exp = Experiment::from_xml_str(SUITE, &jobs).unwrap();

        let apps = exp.instantiate(&jobs).unwrap();
        assert_eq!(apps.len(), 3);
        assert_eq!(apps[0].name, "tpch-1-full");
        assert_eq!(apps[0].n_tasks(), 159);
        assert_eq!(apps[1].data_set.as_deref(), Some("1T"));
    }
}
