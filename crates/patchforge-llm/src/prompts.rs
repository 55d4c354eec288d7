//! Prompt templates for patch generation.
//!
//! One template per patch strategy plus a rollback template that takes
//! the just-generated patch text. All untrusted fields in a
//! [`PromptContext`] are expected to be sanitized before they get here.

use patchforge_core::{OsFamily, PackageManager, PatchStrategy};

/// Values interpolated into the prompt templates.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub cve_id: String,
    pub description: String,
    pub package_name: String,
    pub vulnerable_version: String,
    pub fixed_version: String,
    pub os_family: OsFamily,
    pub os_version: String,
    pub package_manager: PackageManager,
    pub severity: String,
    pub cvss_score: Option<f64>,
}

/// System prompt shared by every generation call.
pub fn system_prompt() -> String {
    "You are a senior Linux system administrator producing remediation scripts \
     for security vulnerabilities. You respond with exactly one bash script and \
     nothing else."
        .to_string()
}

/// Select the user prompt for a strategy.
pub fn prompt_for_strategy(strategy: PatchStrategy, ctx: &PromptContext) -> String {
    match strategy {
        PatchStrategy::PackageUpdate => package_update_prompt(ctx),
        PatchStrategy::ConfigChange => config_change_prompt(ctx),
        PatchStrategy::Workaround => workaround_prompt(ctx),
    }
}

/// Prompt for package-update patches.
pub fn package_update_prompt(ctx: &PromptContext) -> String {
    format!(
        "Create a remediation script for a security vulnerability.\n\
         \n\
         VULNERABILITY DETAILS:\n\
         - CVE ID: {cve}\n\
         - Description: {description}\n\
         - Affected Package: {package} version {vulnerable}\n\
         - Fixed Version: {fixed}\n\
         - Severity: {severity}{cvss}\n\
         \n\
         TARGET SYSTEM:\n\
         - Operating System: {os} {os_version}\n\
         - Package Manager: {pm}\n\
         \n\
         REQUIREMENTS:\n\
         1. Production-ready bash script that safely updates the vulnerable package\n\
         2. Pre-flight checks: verify the current package version, check whether the\n\
            update is needed, verify the package manager is available\n\
         3. Back up the package state before making changes\n\
         4. Update the package to the fixed version using {pm}\n\
         5. Restart affected services gracefully, minimising downtime\n\
         6. Post-update verification: confirm the package updated and the service runs\n\
         7. Comprehensive error handling with clear messages\n\
         8. Log all actions to /var/log/patchforge/remediation.log\n\
         9. Idempotent: safe to run multiple times\n\
         10. Exit codes: 0 success, 1 failure, 2 already patched\n\
         \n\
         SAFETY CONSTRAINTS:\n\
         - No destructive commands (rm -rf /, dd, mkfs)\n\
         - Do not disable security features\n\
         - No system-wide changes beyond the package update\n\
         - Include rollback notes in comments\n\
         \n\
         OUTPUT FORMAT:\n\
         Provide ONLY the bash script with comments explaining each step.\n\
         Start with #!/bin/bash and end with an appropriate exit code.",
        cve = ctx.cve_id,
        description = ctx.description,
        package = ctx.package_name,
        vulnerable = ctx.vulnerable_version,
        fixed = ctx.fixed_version,
        severity = ctx.severity,
        cvss = ctx
            .cvss_score
            .map(|score| format!(" (CVSS {score:.1})"))
            .unwrap_or_default(),
        os = ctx.os_family,
        os_version = ctx.os_version,
        pm = ctx.package_manager,
    )
}

/// Prompt for configuration-change patches.
pub fn config_change_prompt(ctx: &PromptContext) -> String {
    format!(
        "Create a configuration remediation script.\n\
         \n\
         VULNERABILITY DETAILS:\n\
         - CVE ID: {cve}\n\
         - Description: {description}\n\
         - Affected Component: {package}\n\
         \n\
         TARGET SYSTEM:\n\
         - Operating System: {os} {os_version}\n\
         \n\
         REQUIREMENTS:\n\
         1. Safely modify configuration to remediate the vulnerability\n\
         2. Back up the original configuration file before changes\n\
         3. Validate the new configuration before applying it\n\
         4. Restart the service gracefully and verify it starts\n\
         5. Include rollback instructions in comments\n\
         6. Idempotent: safe to run multiple times\n\
         \n\
         SAFETY CONSTRAINTS:\n\
         - Never make irreversible changes\n\
         - Validate configuration syntax before applying\n\
         - Log all actions\n\
         \n\
         OUTPUT FORMAT:\n\
         Provide ONLY the bash script with clear comments.\n\
         Start with #!/bin/bash and use appropriate exit codes.",
        cve = ctx.cve_id,
        description = ctx.description,
        package = ctx.package_name,
        os = ctx.os_family,
        os_version = ctx.os_version,
    )
}

/// Prompt for workaround patches, used when no fixed version exists.
pub fn workaround_prompt(ctx: &PromptContext) -> String {
    format!(
        "Create a workaround that mitigates a vulnerability without a vendor fix.\n\
         \n\
         VULNERABILITY DETAILS:\n\
         - CVE ID: {cve}\n\
         - Description: {description}\n\
         - Affected Component: {package}\n\
         \n\
         TARGET SYSTEM:\n\
         - Operating System: {os} {os_version}\n\
         \n\
         REQUIREMENTS:\n\
         1. Reduce risk without breaking functionality\n\
         2. Document the limitations of the workaround in comments\n\
         3. Keep every change reversible\n\
         4. Include monitoring recommendations\n\
         5. Log all actions\n\
         \n\
         OUTPUT FORMAT:\n\
         Provide ONLY the bash script with detailed comments explaining the workaround.",
        cve = ctx.cve_id,
        description = ctx.description,
        package = ctx.package_name,
        os = ctx.os_family,
        os_version = ctx.os_version,
    )
}

/// Prompt that asks for a rollback script reversing a generated patch.
pub fn rollback_prompt(patch_script: &str) -> String {
    format!(
        "Create a rollback script that safely reverses the changes made by the\n\
         following patch.\n\
         \n\
         ORIGINAL PATCH:\n\
         ```bash\n\
         {patch_script}\n\
         ```\n\
         \n\
         REQUIREMENTS:\n\
         1. Restore the system to its pre-patch state\n\
         2. Use backups created by the original patch where available\n\
         3. Verify the rollback succeeded\n\
         4. Fail with a clear message when rollback is not possible\n\
         \n\
         OUTPUT FORMAT:\n\
         Provide ONLY the rollback bash script with clear comments."
    )
}
