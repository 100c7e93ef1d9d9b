// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build-context assembly: agent files plus generated defaults, packed into
//! the in-memory tar archive Docker expects as a build body.

use serde_json::{json, Value};
use std::io;

use crate::domain::agent::{Agent, ExecutionModel};
use crate::domain::runtime::BuildContext;

pub const DOCKERFILE: &str = "Dockerfile";
pub const REQUIREMENTS: &str = "requirements.txt";
/// Path of the function-model runner inside the image.
pub const FUNCTION_RUNNER_PATH: &str = "/app/_aghub_runner.py";
/// Prefix of the stdout line carrying the runner's JSON result.
pub const RESULT_MARKER: &str = "__AGHUB_RESULT__";

const FUNCTION_RUNNER: &str = include_str!("../../assets/function_runner.py");

/// Materializes `agent` into a build context. Agent-supplied `Dockerfile` and
/// `requirements.txt` win over the generated ones.
pub fn materialize(agent: &Agent, base_image: &str, internal_port: u16) -> BuildContext {
    let mut context = BuildContext::new();
    for (path, contents) in &agent.files {
        context.insert(path.trim_start_matches("./"), contents.as_bytes().to_vec());
    }

    if !context.contains(REQUIREMENTS) {
        let mut requirements = agent.requirements.join("\n");
        if !requirements.is_empty() {
            requirements.push('\n');
        }
        context.insert(REQUIREMENTS, requirements.into_bytes());
    }

    if agent.execution_model == ExecutionModel::Function {
        context.insert("_aghub_runner.py", FUNCTION_RUNNER.as_bytes().to_vec());
    }

    if !context.contains(DOCKERFILE) {
        context.insert(
            DOCKERFILE,
            default_dockerfile(agent, base_image, internal_port).into_bytes(),
        );
    }

    context
}

/// Networked agents run their entry point as the container command; headless
/// ones idle until an exec arrives.
pub fn default_dockerfile(agent: &Agent, base_image: &str, internal_port: u16) -> String {
    let mut dockerfile = format!(
        "FROM {base}\n\
         WORKDIR /app\n\
         ENV PYTHONUNBUFFERED=1\n\
         COPY {req} /app/{req}\n\
         RUN pip install --no-cache-dir -r /app/{req}\n\
         COPY . /app\n",
        base = base_image,
        req = REQUIREMENTS,
    );

    // Entry points are user input; JSON quoting keeps them one token.
    match agent.execution_model {
        ExecutionModel::Function => {
            let entry = Value::from(agent.entry_point.as_str());
            dockerfile.push_str(&format!("ENV AGHUB_ENTRY_POINT={}\n", entry));
            dockerfile.push_str("CMD [\"tail\", \"-f\", \"/dev/null\"]\n");
        }
        ExecutionModel::AcpServer | ExecutionModel::Persistent => {
            dockerfile.push_str(&format!(
                "ENV PORT={port}\nEXPOSE {port}\nCMD {cmd}\n",
                port = internal_port,
                cmd = json!(["python", agent.entry_point]),
            ));
        }
    }

    dockerfile
}

/// Packs the context into an uncompressed tar archive.
pub fn to_tar(context: &BuildContext) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in context.files() {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, path, contents.as_slice())?;
    }
    builder.into_inner()
}
