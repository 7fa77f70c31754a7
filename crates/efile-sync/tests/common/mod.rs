#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use efile_core::SchemaTable;
use efile_storage::{DocumentResponse, DocumentSource, FetchError};
use efile_sync::{PipelineConfig, RunController};

pub const YEAR: i32 = 2016;

pub fn url(ein: &str) -> String {
    format!("https://filings.example.test/{ein}_public.xml")
}

pub fn ein(i: usize) -> String {
    format!("{:09}", 300_000_000 + i)
}

/// A current-schema return for `ein` with a revenue figure and officer amounts.
pub fn return_xml(ein: &str, tax_year: i32, revenue: i64, officers: &[i64]) -> Vec<u8> {
    let officers: String = officers
        .iter()
        .map(|amount| {
            format!(
                "<Form990PartVIISectionAGrp><PersonNm>OFFICER</PersonNm>\
                 <ReportableCompFromOrgAmt>{amount}</ReportableCompFromOrgAmt>\
                 </Form990PartVIISectionAGrp>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<Return xmlns="http://www.irs.gov/efile" returnVersion="2015v2.1">
  <ReturnHeader>
    <TaxYr>{tax_year}</TaxYr>
    <Filer>
      <EIN>{ein}</EIN>
      <BusinessName><BusinessNameLine1Txt>ORG {ein}</BusinessNameLine1Txt></BusinessName>
    </Filer>
  </ReturnHeader>
  <ReturnData>
    <IRS990>
      <CYTotalRevenueAmt>{revenue}</CYTotalRevenueAmt>
      {officers}
    </IRS990>
  </ReturnData>
</Return>"#
    )
    .into_bytes()
}

#[derive(Debug, Clone)]
enum Served {
    Document(Vec<u8>),
    Missing,
}

/// In-memory remote: serves registered documents, can fail a URL a set number
/// of times, and counts every request.
#[derive(Default)]
pub struct FakeRemote {
    served: Mutex<HashMap<String, Served>>,
    failures: Mutex<HashMap<String, (u16, usize)>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.served
            .lock()
            .unwrap()
            .insert(url.to_string(), Served::Document(body));
    }

    pub fn serve_missing(&self, url: &str) {
        self.served
            .lock()
            .unwrap()
            .insert(url.to_string(), Served::Missing);
    }

    /// Answer `url` with `status` for the next `times` requests.
    pub fn fail(&self, url: &str, status: u16, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, times));
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl DocumentSource for FakeRemote {
    async fn fetch_document(&self, url: &str) -> Result<DocumentResponse, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;

        if let Some((status, remaining)) = self.failures.lock().unwrap().get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::UnexpectedStatus {
                    status: *status,
                    url: url.to_string(),
                });
            }
        }

        match self.served.lock().unwrap().get(url) {
            Some(Served::Document(body)) => Ok(DocumentResponse::Found(body.clone())),
            Some(Served::Missing) => Ok(DocumentResponse::Missing),
            None => Err(FetchError::UnexpectedStatus {
                status: 500,
                url: url.to_string(),
            }),
        }
    }
}

/// Writes `index_<YEAR>.json` for `count` filings and serves a matching return
/// for each one.
pub fn seed_year(data_dir: &Path, remote: &FakeRemote, count: usize) -> Vec<String> {
    let eins: Vec<String> = (0..count).map(ein).collect();
    let entries: Vec<serde_json::Value> = eins
        .iter()
        .map(|ein| {
            serde_json::json!({
                "EIN": ein,
                "URL": url(ein),
                "TaxPeriod": format!("{YEAR}12"),
                "FormType": "990",
            })
        })
        .collect();
    let mut document = serde_json::Map::new();
    document.insert(format!("Filings{YEAR}"), serde_json::Value::Array(entries));
    write_manifest(data_dir, &serde_json::Value::Object(document));

    for (i, ein) in eins.iter().enumerate() {
        let revenue = 1000 * (i as i64 + 1);
        remote.serve(&url(ein), return_xml(ein, YEAR, revenue, &[revenue / 10, 500]));
    }
    eins
}

pub fn write_manifest(data_dir: &Path, document: &serde_json::Value) {
    let index = data_dir.join("index");
    std::fs::create_dir_all(&index).unwrap();
    std::fs::write(
        index.join(format!("index_{YEAR}.json")),
        serde_json::to_vec_pretty(document).unwrap(),
    )
    .unwrap();
}

pub fn config(data_dir: &Path, group_size: usize) -> PipelineConfig {
    PipelineConfig {
        data_dir: data_dir.to_path_buf(),
        group_size,
        session_size: 3,
        concurrency: 2,
        retry_backoff: Duration::ZERO,
        max_group_attempts: 3,
        ..Default::default()
    }
}

pub fn controller(config: PipelineConfig, remote: Arc<FakeRemote>) -> RunController {
    let schema = Arc::new(SchemaTable::builtin().unwrap());
    RunController::new(config, schema, remote)
}
