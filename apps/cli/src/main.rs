use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use courseware_core_sdk::{
    agents::{Agent, AgentKind},
    config::Settings,
    llm,
    models::{NewProfile, ProfileUpdate, ProviderSetting},
    server,
    session::Session,
    telemetry,
};

/**
 * \brief 课件生成系统的模型配置管理 CLI。
 */
#[derive(Parser, Debug)]
#[command(name = "courseware", version, about = "Courseware model profile manager")]
struct Cli {
    /** \brief 配置库路径，覆盖 COURSEWARE_DB */
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /** \brief 旧版 JSON 配置路径，覆盖 COURSEWARE_LEGACY_MODELS */
    #[arg(long, global = true)]
    legacy: Option<PathBuf>,
    /** \brief 密钥文件路径，覆盖 COURSEWARE_SECRETS */
    #[arg(long, global = true)]
    secrets: Option<PathBuf>,
    /** \brief `.env` 文件路径，覆盖 COURSEWARE_DOTENV */
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 管理已注册的模型配置。
     */
    #[command(subcommand)]
    Profiles(ProfileCommand),

    /**
     * \brief 解析配置名并打印结果（API Key 只显示是否存在）。
     */
    Resolve { name: String },

    /**
     * \brief 列出各已知凭据是否可用。
     */
    Credentials,

    /**
     * \brief 用解析后的配置请求模型列表，检查地址与凭据是否可用。
     */
    Check { name: String },

    #[command(subcommand)]
    Providers(ProviderCommand),

    /**
     * \brief 立即导入旧版 JSON 配置。
     */
    Migrate,

    /**
     * \brief 开关文件日志。
     */
    Telemetry {
        #[arg(value_enum)]
        state: Switch,
    },

    /**
     * \brief 以指定 Agent 发送一次 JSON 模式请求。
     */
    Ask {
        #[arg(long, default_value = "assessment")]
        agent: AgentKind,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long, default_value = "Respond with a single JSON object.")]
        system: String,
        #[arg(long)]
        prompt: String,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileCommand {
    List,
    Show {
        name: String,
    },
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        model: String,
        #[command(flatten)]
        fields: ProfileFields,
    },
    Update {
        name: String,
        #[arg(long)]
        model: Option<String>,
        #[command(flatten)]
        fields: ProfileFields,
    },
    Remove {
        name: String,
    },
}

#[derive(Args, Debug)]
struct ProfileFields {
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    temperature: Option<f64>,
    /** \brief 凭据族，如 OPENROUTER / OPENAI / GEMINI */
    #[arg(long)]
    api_provider: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ProviderCommand {
    List,
    Set {
        name: String,
        #[arg(long, default_value_t = false)]
        disable: bool,
        #[arg(long)]
        base_url: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = Settings::from_env();
        if let Some(path) = &self.db {
            settings.db_path = path.clone();
        }
        if let Some(path) = &self.legacy {
            settings.legacy_profiles_path = path.clone();
        }
        if let Some(path) = &self.secrets {
            settings.secrets_path = path.clone();
        }
        if let Some(path) = &self.env_file {
            settings.dotenv_path = path.clone();
        }
        if let Some(path) = &self.log_dir {
            settings.log_dir = path.clone();
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings();

    // 先装好日志，首次访问存储时的旧版导入才有日志输出
    telemetry::init_from_settings(&settings).context("init logging failed")?;
    let session = Session::open(&settings).context("open profile store failed")?;

    match cli.command {
        Commands::Profiles(cmd) => run_profiles(&session, cmd)?,
        Commands::Resolve { name } => {
            let resolved = session.resolve_profile(&name);
            let view = serde_json::json!({
                "name": resolved.name,
                "provider": resolved.provider,
                "model_id": resolved.model_id,
                "base_url": resolved.base_url,
                "temperature": resolved.temperature,
                "api_provider": resolved.api_provider,
                "has_api_key": resolved.has_credential(),
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Credentials => {
            for (key, value) in session.credential_set() {
                let state = if value.is_empty() { "missing" } else { "set" };
                println!("{:<20} {}", key, state);
            }
        }
        Commands::Check { name } => {
            let resolved = session.resolve_profile(&name);
            let models = llm::list_models(&resolved)
                .await
                .with_context(|| format!("check {} via {} failed", resolved.name, resolved.base_url))?;
            let listed = models.iter().any(|m| m == &resolved.model_id);
            println!(
                "{} reachable: {} model(s) listed, {} {}",
                resolved.name,
                models.len(),
                resolved.model_id,
                if listed { "available" } else { "not listed" }
            );
        }
        Commands::Providers(cmd) => run_providers(&session, cmd)?,
        Commands::Migrate => {
            let count = session.import_legacy();
            println!("Migrated {} legacy profile(s)", count);
        }
        Commands::Telemetry { state } => {
            let enabled = matches!(state, Switch::On);
            session
                .set_telemetry_enabled(enabled)
                .context("save telemetry failed")?;
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
        Commands::Ask {
            agent,
            profile,
            system,
            prompt,
        } => {
            let agent = Agent::new(agent, &session);
            telemetry::log_event(
                "cli.ask",
                &format!("agent={} prompt_len={}", agent.kind(), prompt.len()),
            );
            let reply = agent
                .complete_json(profile.as_deref(), &system, &prompt)
                .await?;
            println!("{}", reply);
        }
        Commands::Serve { addr } => {
            drop(session);
            server::run(&addr, settings).await?;
        }
    }

    Ok(())
}

fn run_profiles(session: &Session, cmd: ProfileCommand) -> Result<()> {
    match cmd {
        ProfileCommand::List => {
            let stored = session.list_profiles().context("list profiles failed")?;
            for profile in stored.iter() {
                println!(
                    "{} | {} | {} | {} | {}",
                    profile.name,
                    profile.model_id,
                    profile.base_url,
                    profile.temperature,
                    profile.api_provider
                );
            }
            println!(
                "Available: {}",
                session.available_profiles()?.join(", ")
            );
        }
        ProfileCommand::Show { name } => {
            let profile = session
                .get_profile(&name)?
                .with_context(|| format!("profile '{}' not found", name))?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        ProfileCommand::Add {
            name,
            model,
            fields,
        } => {
            if name.trim().is_empty() || model.trim().is_empty() {
                bail!("--name and --model must not be blank");
            }
            let profile = NewProfile {
                name: name.clone(),
                model_id: model,
                provider: fields.provider,
                base_url: fields.base_url,
                temperature: fields.temperature,
                api_provider: fields.api_provider,
            };
            if !session.create_profile(&profile).context("save profile failed")? {
                bail!("Model Display Name '{}' already exists", name.trim());
            }
            println!("Saved profile {}", name.trim());
        }
        ProfileCommand::Update {
            name,
            model,
            fields,
        } => {
            let update = ProfileUpdate {
                model_id: model,
                provider: fields.provider,
                base_url: fields.base_url,
                temperature: fields.temperature,
                api_provider: fields.api_provider,
            };
            if update.is_empty() {
                bail!("nothing to update");
            }
            if !session.update_profile(&name, &update)? {
                bail!("profile '{}' not found", name);
            }
            println!("Updated profile {}", name);
        }
        ProfileCommand::Remove { name } => {
            if !session.delete_profile(&name)? {
                bail!("profile '{}' not found", name);
            }
            println!("Removed profile {}", name);
        }
    }
    Ok(())
}

fn run_providers(session: &Session, cmd: ProviderCommand) -> Result<()> {
    match cmd {
        ProviderCommand::List => {
            for setting in session.provider_settings()? {
                println!(
                    "{} | enabled={} | {}",
                    setting.provider_name,
                    setting.is_enabled,
                    setting.base_url.as_deref().unwrap_or("-")
                );
            }
        }
        ProviderCommand::Set {
            name,
            disable,
            base_url,
        } => {
            let setting = ProviderSetting {
                provider_name: name.trim().to_ascii_uppercase(),
                is_enabled: !disable,
                base_url: base_url.filter(|u| !u.trim().is_empty()),
            };
            session
                .set_provider_setting(&setting)
                .context("save provider setting failed")?;
            println!(
                "Saved provider {} (enabled={})",
                setting.provider_name, setting.is_enabled
            );
        }
    }
    Ok(())
}
