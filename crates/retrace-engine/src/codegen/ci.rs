//! CI pipeline descriptors, keyed only on session metadata and platform.

use super::script_file_name;
use retrace_common::error::RecorderError;
use retrace_common::protocol::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiPlatform {
    GithubActions,
    Gitlab,
    Jenkins,
}

impl CiPlatform {
    pub fn from_name(name: &str) -> Result<Self, RecorderError> {
        match name.to_ascii_lowercase().as_str() {
            "github" | "github_actions" | "github-actions" => Ok(Self::GithubActions),
            "gitlab" | "gitlab_ci" | "gitlab-ci" => Ok(Self::Gitlab),
            "jenkins" => Ok(Self::Jenkins),
            other => Err(RecorderError::invalid_field(
                "platform",
                format!("unknown CI platform '{other}' (expected github, gitlab or jenkins)"),
            )),
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::GithubActions => ".github/workflows/retrace.yml",
            Self::Gitlab => ".gitlab-ci.yml",
            Self::Jenkins => "Jenkinsfile",
        }
    }
}

pub fn render_ci(session: &Session, platform: CiPlatform) -> String {
    let browser = session.metadata.browser.as_str();
    let spec = script_file_name(session);
    match platform {
        CiPlatform::GithubActions => format!(
            "name: retrace\n\
             on: [push, pull_request]\n\
             jobs:\n  \
               e2e:\n    \
                 runs-on: ubuntu-latest\n    \
                 steps:\n      \
                   - uses: actions/checkout@v4\n      \
                   - uses: actions/setup-node@v4\n        \
                     with:\n          \
                       node-version: 20\n      \
                   - run: npm ci\n      \
                   - run: npx playwright install --with-deps {browser}\n      \
                   - run: npx playwright test tests/{spec}\n      \
                   - uses: actions/upload-artifact@v4\n        \
                     if: failure()\n        \
                     with:\n          \
                       name: playwright-report\n          \
                       path: playwright-report/\n"
        ),
        CiPlatform::Gitlab => format!(
            "e2e:\n  \
               image: mcr.microsoft.com/playwright:v1.47.0-jammy\n  \
               script:\n    \
                 - npm ci\n    \
                 - npx playwright test tests/{spec} --browser={browser}\n  \
               artifacts:\n    \
                 when: on_failure\n    \
                 paths:\n      \
                   - playwright-report/\n"
        ),
        CiPlatform::Jenkins => format!(
            "pipeline {{\n  \
               agent {{ docker {{ image 'mcr.microsoft.com/playwright:v1.47.0-jammy' }} }}\n  \
               stages {{\n    \
                 stage('e2e') {{\n      \
                   steps {{\n        \
                     sh 'npm ci'\n        \
                     sh 'npx playwright test tests/{spec}'\n      \
                   }}\n    \
                 }}\n  \
               }}\n  \
               post {{\n    \
                 failure {{ archiveArtifacts artifacts: 'playwright-report/**' }}\n  \
               }}\n\
             }}\n"
        ),
    }
}
