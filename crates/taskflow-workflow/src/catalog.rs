//! Registry of workflow definitions owned by one engine.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{PoisonError, RwLock},
};

use serde::Serialize;

use crate::{
    definition::{
        AiTaskParams, AnalysisParams, DeployParams, FileOperation, FileParams, Step, StepKind,
        TestParams, WorkflowDefinition,
    },
    error::DefinitionError,
};

/// Catalog listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    /// Registration key used by `execute_workflow`.
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: usize,
}

/// Workflow definitions keyed by registration name.
#[derive(Debug, Default)]
pub struct WorkflowCatalog {
    definitions: RwLock<BTreeMap<String, WorkflowDefinition>>,
}

impl WorkflowCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with the built-in workflows.
    #[must_use]
    pub fn with_builtins() -> Self {
        let catalog = Self::new();
        for (name, definition) in builtin_workflows() {
            catalog.register(name, definition);
        }
        catalog
    }

    /// Register or replace a definition.
    pub fn register(&self, name: impl Into<String>, definition: WorkflowDefinition) {
        let name = name.into();
        tracing::debug!(workflow = %name, steps = definition.steps.len(), "workflow registered");
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, definition);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<WorkflowDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Every registered workflow, sorted by registration name.
    #[must_use]
    pub fn list(&self) -> Vec<CatalogEntry> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, def)| CatalogEntry {
                id: id.clone(),
                name: def.name.clone(),
                description: def.description.clone(),
                steps: def.steps.len(),
            })
            .collect()
    }

    /// Load every `*.json` definition in `dir`, registered under its file stem.
    ///
    /// A missing directory loads nothing. Malformed files are logged and skipped.
    ///
    /// # Errors
    /// Returns error if the directory exists but cannot be read.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize, DefinitionError> {
        let io_err = |source| DefinitionError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %dir.display(), "no workflow directory");
                return Ok(0);
            }
            Err(e) => return Err(io_err(e)),
        };

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let parsed = tokio::fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<WorkflowDefinition>(&bytes).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(definition) => {
                    self.register(name, definition);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping workflow definition: {e}");
                }
            }
        }

        tracing::info!(loaded, path = %dir.display(), "workflow definitions loaded");
        Ok(loaded)
    }
}

fn analysis(name: &str, analysis_type: &str) -> Step {
    Step::new(
        name,
        StepKind::CodeAnalysis(AnalysisParams {
            target: "all".into(),
            analysis_type: analysis_type.into(),
        }),
    )
}

fn ai_task(name: &str, task: &str, prompt: &str) -> Step {
    Step::new(
        name,
        StepKind::AiTask(AiTaskParams {
            task: task.into(),
            prompt: prompt.into(),
            model: None,
        }),
    )
}

fn test_step(name: &str, test_type: &str, target: &str) -> Step {
    Step::new(
        name,
        StepKind::TestExecution(TestParams {
            test_type: test_type.into(),
            target: target.into(),
        }),
    )
}

/// Workflows registered on every engine.
#[must_use]
pub fn builtin_workflows() -> Vec<(&'static str, WorkflowDefinition)> {
    vec![
        (
            "code_analysis",
            WorkflowDefinition::new(
                "Code Analysis",
                "Analyze code quality and suggest improvements",
                vec![
                    Step::new(
                        "Scan Files",
                        StepKind::FileOperation(FileParams {
                            operation: FileOperation::List,
                            path: ".".into(),
                            content: None,
                        }),
                    ),
                    analysis("Analyze Code", "quality"),
                    ai_task("Generate Report", "generate_report", "Generate a code quality report"),
                ],
            ),
        ),
        (
            "performance_optimization",
            WorkflowDefinition::new(
                "Performance Optimization",
                "Optimize application performance",
                vec![
                    analysis("Performance Analysis", "performance"),
                    ai_task(
                        "Generate Optimizations",
                        "optimize_performance",
                        "Suggest performance optimizations",
                    ),
                ],
            ),
        ),
        (
            "run_tests",
            WorkflowDefinition::new(
                "Run Tests",
                "Execute the test suites",
                vec![
                    test_step("Unit Tests", "unit", "all"),
                    test_step("Integration Tests", "integration", "api"),
                    test_step("E2E Tests", "e2e", "frontend"),
                ],
            ),
        ),
        (
            "deploy",
            WorkflowDefinition::new(
                "Deploy Application",
                "Test, deploy and verify the application",
                vec![
                    test_step("Pre-deployment Tests", "all", "all"),
                    Step::new(
                        "Deploy to Production",
                        StepKind::Deployment(DeployParams {
                            environment: "production".into(),
                            target: "app".into(),
                        }),
                    ),
                    test_step("Post-deployment Verification", "smoke", "production"),
                ],
            ),
        ),
    ]
}
