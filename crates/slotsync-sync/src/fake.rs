//! Scripted [`PortalConnector`] for orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use slotsync_core::{Credentials, SessionCookie, SessionTokens, SyncError};
use slotsync_portal::{DayExtraction, DriverState, PortalConnector, PortalSession, ResultsOutcome, ScrapedRow};

#[derive(Debug, Default)]
pub struct PortalScript {
    /// Per-date answers, consumed in order; an exhausted queue answers with an empty day.
    pub answers: HashMap<NaiveDate, VecDeque<Result<DayExtraction, SyncError>>>,
    pub login_error: Option<SyncError>,
    pub resume_answer: Option<Result<bool, SyncError>>,
    pub panic_on: Option<NaiveDate>,
    pub query_delay: Duration,
    pub opens: usize,
    pub logins: usize,
    pub resumes: usize,
    pub queries: Vec<NaiveDate>,
    pub voltars: usize,
    pub closes: usize,
}

#[derive(Clone, Default)]
pub struct ScriptedPortal {
    script: Arc<Mutex<PortalScript>>,
}

pub fn row(date: NaiveDate, time: &str, document: &str, name: &str) -> ScrapedRow {
    ScrapedRow {
        date,
        time: time.to_string(),
        document_number: document.to_string(),
        name: name.to_string(),
        phone: None,
        email: None,
        process_type: None,
        category: None,
        status_hint: None,
        slot_token: None,
    }
}

pub fn table(date: NaiveDate, rows: Vec<ScrapedRow>) -> DayExtraction {
    DayExtraction {
        date,
        outcome: ResultsOutcome::Table,
        rows,
        rejected: Vec::new(),
    }
}

pub fn tokens() -> SessionTokens {
    SessionTokens {
        cookies: vec![SessionCookie {
            name: "JSESSIONID".into(),
            value: "abc123".into(),
            domain: None,
            path: Some("/".into()),
        }],
        landing_url: None,
    }
}

impl ScriptedPortal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, PortalScript> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn answer(&self, date: NaiveDate, answer: Result<DayExtraction, SyncError>) -> &Self {
        self.lock().answers.entry(date).or_default().push_back(answer);
        self
    }
}

struct ScriptedSession {
    script: Arc<Mutex<PortalScript>>,
    state: DriverState,
}

impl ScriptedSession {
    fn lock(&self) -> MutexGuard<'_, PortalScript> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl PortalConnector for ScriptedPortal {
    async fn open(&self, _account_id: &str) -> Result<Box<dyn PortalSession>, SyncError> {
        self.lock().opens += 1;
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            state: DriverState::BrowserReady,
        }))
    }
}

#[async_trait]
impl PortalSession for ScriptedSession {
    fn state(&self) -> DriverState {
        self.state
    }

    async fn resume(&mut self, _tokens: &SessionTokens) -> Result<bool, SyncError> {
        let answer = {
            let mut script = self.lock();
            script.resumes += 1;
            script.resume_answer.clone().unwrap_or(Ok(true))
        };
        if answer == Ok(true) {
            self.state = DriverState::Authenticated;
        }
        answer
    }

    async fn login(&mut self, _credentials: &Credentials) -> Result<SessionTokens, SyncError> {
        let error = {
            let mut script = self.lock();
            script.logins += 1;
            script.login_error.clone()
        };
        match error {
            Some(err) => Err(err),
            None => {
                self.state = DriverState::Authenticated;
                Ok(tokens())
            }
        }
    }

    async fn buscar_agendamentos(&mut self, date: NaiveDate) -> Result<DayExtraction, SyncError> {
        let (delay, panics, answer) = {
            let mut script = self.lock();
            script.queries.push(date);
            let answer = script.answers.get_mut(&date).and_then(VecDeque::pop_front);
            (script.query_delay, script.panic_on == Some(date), answer)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if panics {
            panic!("scripted portal blew up on {date}");
        }
        let answer = answer.unwrap_or_else(|| Ok(DayExtraction::empty(date, ResultsOutcome::NoResults)));
        if answer.is_ok() {
            self.state = DriverState::ResultsExtracted(date);
        }
        answer
    }

    async fn voltar(&mut self) -> bool {
        self.lock().voltars += 1;
        self.state = DriverState::FormReady;
        true
    }

    async fn sair(&mut self) -> bool {
        self.state = DriverState::BrowserReady;
        true
    }

    async fn close(&mut self) {
        self.lock().closes += 1;
        self.state = DriverState::SessionClosed;
    }
}
