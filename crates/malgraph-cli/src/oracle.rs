//! Oracle backed by an OpenAI-compatible chat completion endpoint

use std::time::Duration;

use anyhow::{Context, Result};
use malgraph_core::ServiceError;
use malgraph_core::config::OracleConfig;
use malgraph_core::oracle::{Judgement, Oracle, RetryPolicy, with_retry};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SERVICE: &str = "oracle";
const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

fn instructions(kind: Judgement) -> &'static str {
    match kind {
        Judgement::Command => {
            "You review arguments of Node.js command execution APIs. Answer Yes when the \
             command downloads and runs files, runs a local shell script or executable, opens \
             a reverse shell, deletes system or user files, or collects local data and sends \
             it to a remote host or a DNS lookup. Answer No for echoing, deleting local build \
             artifacts, downloads that are not executed, and strings you cannot judge. \
             Answer only Yes or No."
        }
        Judgement::Executable => {
            "You review arguments of a Node.js API that runs an executable file. Answer Yes \
             for .bat, .exe, .sh or markdown files. Answer No for JavaScript files and for \
             strings that are not file names. Answer only Yes or No."
        }
        Judgement::FileRead => {
            "You review the path argument of a Node.js file-reading API. Answer Yes when it \
             reads credentials, private keys or certificates, shell profiles or histories, \
             system configuration, npm or Node.js core files, or metadata directories such as \
             .env, .svn or .github. Answer No for package manifests and ordinary project \
             configuration. Answer only Yes or No."
        }
        Judgement::FileWrite => {
            "You review the path argument of a Node.js file-writing API. Answer Yes when it \
             writes to shell profiles or histories, system configuration, ssh, passwd, shadow \
             or ssl paths, npm or Node.js core files, or the filesystem root. Answer No for \
             JavaScript sources and package manifests. Answer only Yes or No."
        }
        Judgement::SearchPath => {
            "You review the argument of a Node.js file search API. Answer Yes when it searches \
             home directories, credential stores, browser profiles, wallets or system \
             directories. Answer only Yes or No."
        }
        Judgement::Url => {
            "You review the argument of a Node.js API that opens a network connection or sends \
             data. Locate the URL and answer Yes when it is suspicious: shortened or obfuscated \
             links, misspelled or random domains, raw IP addresses, unusual ports, or requests \
             for personal data. Answer only Yes or No."
        }
        Judgement::Program => {
            "You review a JavaScript code string that is evaluated at run time. Answer Yes when \
             the code is potentially malicious. Answer only Yes or No."
        }
        Judgement::ShellCommand => {
            "You review an npm install-time shell script. Answer Yes when it collects local \
             data and sends it out, downloads and runs files, opens a reverse shell, deletes \
             important files or runs a local shell script or executable. Answer No for \
             downloads that are not executed, invalid commands and ordinary build steps. \
             Answer only Yes or No."
        }
        Judgement::ObfuscatedSource => {
            "You review a JavaScript source file. Answer Yes when the code is deliberately \
             obfuscated, for example hex-encoded identifiers, string array rotation, packed \
             eval payloads or control-flow flattening. Minified code is not obfuscated. \
             Answer only Yes or No."
        }
    }
}

/// `true` when the first word of `answer` is `yes`.
fn parse_verdict(answer: &str) -> bool {
    answer
        .trim_start()
        .split(|c: char| !c.is_alphanumeric())
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("yes"))
}

pub struct LlmOracle {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
    policy: RetryPolicy,
}

impl LlmOracle {
    pub fn from_config(config: &OracleConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).with_context(|| {
            format!(
                "Oracle is enabled but the {} environment variable is not set",
                config.api_key_env
            )
        })?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key,
            policy: config.retry_policy(),
        })
    }

    fn complete(&self, system: &str, user: &str) -> Result<String, ServiceError> {
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| ServiceError::transport(SERVICE, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::transport(SERVICE, format!("HTTP {status}")));
        }
        let body: ChatResponse = response
            .json()
            .map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::malformed(SERVICE, "response has no message content"))
    }
}

impl Oracle for LlmOracle {
    fn judge(&self, kind: Judgement, subject: &str) -> Result<bool, ServiceError> {
        let answer = with_retry(SERVICE, self.policy, || {
            self.complete(instructions(kind), subject)
        })?;
        let verdict = parse_verdict(&answer);
        debug!(kind = kind.as_str(), verdict, "oracle answered");
        Ok(verdict)
    }
}
