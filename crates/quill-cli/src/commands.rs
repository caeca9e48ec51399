use anyhow::{anyhow, bail, Context, Result};
use quill_runtime::{load_skill_catalog, QuillService, SkillCatalog};
use quill_scheduler::{CronTicker, FetchCycleReport};
use quill_skill_cache::{skill_event_channel, BucketAvailability, SkillStreamEvent};

use crate::cli_args::{Cli, QuillCommand};

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    match &cli.command {
        QuillCommand::Serve { cron } => serve(&cli, cron).await,
        QuillCommand::Run { skill, input } => run_skill(&cli, skill, input.clone()).await,
        QuillCommand::Buckets { skill } => {
            let service = QuillService::build(&cli.service_config())?;
            service.load_cache();
            if service.cache().policy(skill).is_none() {
                bail!("unknown skill '{skill}'");
            }
            let buckets = service.cache().list_available_buckets(skill);
            println!("{}", render_bucket_listing(&buckets)?);
            Ok(())
        }
        QuillCommand::Clear { skill, all } => {
            let service = QuillService::build(&cli.service_config())?;
            if *all {
                service.cache().clear_all()?;
                println!("cleared {} skills", service.catalog().skills().len());
            } else if let Some(skill) = skill {
                service.cache().clear(skill)?;
                println!("cleared {skill}");
            }
            Ok(())
        }
        QuillCommand::Catalog => {
            let catalog = load_skill_catalog(&cli.catalog)?;
            print!("{}", render_catalog_summary(&catalog));
            Ok(())
        }
    }
}

async fn serve(cli: &Cli, cron: &str) -> Result<()> {
    let service = QuillService::build(&cli.service_config())?;
    let ticker = CronTicker::new(cron, service.catalog().timezone())?;
    service.load_cache();
    let scheduler = service.fetch_scheduler()?;
    let mut sweeper = service.pool().spawn_idle_sweeper();

    let mut handle = scheduler.start(Box::new(ticker)).await;
    println!("{}", render_cycle_summary(handle.catch_up_report()));
    println!("serving {} skills on '{cron}'", service.catalog().skills().len());

    let signal = tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c");
    handle.shutdown().await;
    sweeper.shutdown().await;
    let terminated = service.shutdown().await;
    println!("shutdown complete: terminated {terminated} agent sessions");
    signal
}

async fn run_skill(cli: &Cli, skill: &str, input: Option<String>) -> Result<()> {
    let service = QuillService::build(&cli.service_config())?;
    service.load_cache();
    let (events, mut receiver) = skill_event_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match render_event_line(&event) {
                Ok(line) => println!("{line}"),
                Err(error) => tracing::warn!(error = %error, "failed to encode skill event"),
            }
        }
    });
    let outcome = service.request(skill, input, Some(events)).await;
    if let Err(error) = printer.await {
        tracing::warn!(error = %error, "skill event printer failed");
    }
    service.shutdown().await;
    outcome
        .map(|_| ())
        .map_err(|error| anyhow!("skill '{skill}' failed ({}): {error}", error.kind.as_str()))
}

pub(crate) fn render_event_line(event: &SkillStreamEvent) -> Result<String> {
    serde_json::to_string(event).context("failed to encode skill event")
}

pub(crate) fn render_bucket_listing(buckets: &[BucketAvailability]) -> Result<String> {
    serde_json::to_string_pretty(buckets).context("failed to encode bucket listing")
}

pub(crate) fn render_cycle_summary(report: &FetchCycleReport) -> String {
    format!(
        "fetch cycle: trigger={:?} tick={} fetched={} fresh={} failed={}",
        report.trigger, report.tick, report.fetched, report.fresh, report.failed
    )
}

pub(crate) fn render_catalog_summary(catalog: &SkillCatalog) -> String {
    let mut lines = vec![format!(
        "catalog: timezone={} skills={}",
        catalog.timezone(),
        catalog.skills().len()
    )];
    for skill in catalog.skills() {
        lines.push(format!(
            "- {} class={} executor={} scheduled={} group={}",
            skill.id,
            skill.policy.class().as_str(),
            skill.executor.kind(),
            skill.scheduled,
            skill.group.as_deref().unwrap_or("none")
        ));
    }
    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use quill_runtime::SkillCatalog;
    use quill_skill_cache::{FlightRole, SkillStreamEvent};

    use super::{render_catalog_summary, render_event_line};

    #[test]
    fn unit_event_lines_are_tagged_json() {
        let line = render_event_line(&SkillStreamEvent::Start {
            skill_id: "trending".to_string(),
            role: FlightRole::Waiter,
        })
        .expect("line");
        let value: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["type"], "start");
        assert_eq!(value["skill_id"], "trending");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn functional_catalog_summary_lists_expanded_skills() {
        let catalog = SkillCatalog::from_json_str(
            r#"{
              "timezone": "Europe/Berlin",
              "skills": [
                {"id": "digest", "class": {"type": "periodic"}, "executor": {"type": "agent", "prompt": "Summarize"}, "scheduled": false}
              ],
              "fan_out": [
                {"group": "topics", "sub_groups": ["ai"], "class": {"type": "frequent", "window_hours": 2}, "executor": {"type": "command", "program": "/bin/echo"}}
              ]
            }"#,
        )
        .expect("catalog");
        assert_eq!(
            render_catalog_summary(&catalog),
            "catalog: timezone=Europe/Berlin skills=2\n\
             - digest class=periodic executor=agent scheduled=false group=none\n\
             - topics:ai class=frequent executor=command scheduled=true group=topics\n"
        );
    }
}
