//! 命令行入口：参数定义与各子命令的执行。

use std::io::{self, Write};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

use crate::app::App;
use crate::base_system::json_extract::{pick_string, value_text};
use crate::download::progress::CliBars;
use crate::error::AcquireError;

#[derive(Debug, Parser)]
#[command(name = "loan-book-downloader", version)]
#[command(about = "下载已借阅的电子书并去除借阅保护")]
pub struct Cli {
    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// 数据目录路径（config.yml、books、temp、logs 均在其下）
    #[arg(long)]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// 登录并保存凭据
    Login {
        #[arg(long)]
        email: String,
        /// 不提供时从标准输入读取
        #[arg(long)]
        password: Option<String>,
    },
    /// 删除本地凭据
    Logout,
    /// 已借书架（标注是否已下载）
    Shelf,
    /// 搜索书目
    Search {
        query: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// 查看书籍详情
    Detail { item_id: String },
    /// 借阅
    Borrow { item_id: String },
    /// 归还（参数为借阅记录 ID）
    Return { borrow_book_id: String },
    /// 下载并解包，可一次提交多本
    Download {
        #[arg(required = true)]
        item_ids: Vec<String>,
    },
    /// 列出本地书库
    Library,
}

fn explain(err: AcquireError) -> anyhow::Error {
    if err.requires_login() {
        anyhow!("{err}（请先执行 login）")
    } else {
        anyhow!(err)
    }
}

fn read_password() -> Result<String> {
    print!("密码: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let pw = line.trim_end_matches(['\r', '\n']).to_string();
    if pw.is_empty() {
        return Err(anyhow!("密码不能为空"));
    }
    Ok(pw)
}

fn print_json(v: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

pub async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => read_password()?,
            };
            let rec = app.session.login(&email, &password).await.map_err(explain)?;
            let who = rec
                .name
                .clone()
                .or_else(|| rec.email.clone())
                .unwrap_or_else(|| rec.id.as_text());
            println!("已登录：{who}");
        }
        Command::Logout => {
            app.catalog.clear_cache().await;
            if app.session.logout().await.map_err(explain)? {
                println!("已退出登录");
            } else {
                println!("当前未登录");
            }
        }
        Command::Shelf => {
            let shelf = app.synced_shelf().await.map_err(explain)?;
            if shelf.is_empty() {
                println!("书架为空");
            }
            for item in &shelf {
                let Some(map) = item.as_object() else {
                    continue;
                };
                let mark = if item["is_local"].as_bool().unwrap_or(false) {
                    "✓"
                } else {
                    " "
                };
                println!(
                    "[{mark}] {}  {}  (借阅 {})",
                    pick_string(map, &["book_id"]).unwrap_or_default(),
                    pick_string(map, &["book_title"]).unwrap_or_default(),
                    map.get("id").and_then(value_text).unwrap_or_default(),
                );
            }
        }
        Command::Search { query, offset } => {
            let items = app.catalog.search(&query, offset).await.map_err(explain)?;
            if items.is_empty() {
                println!("没有结果");
            }
            for it in items {
                match it.author {
                    Some(a) => println!("{}  {} / {a}", it.id, it.title),
                    None => println!("{}  {}", it.id, it.title),
                }
            }
        }
        Command::Detail { item_id } => {
            let detail = app.catalog.item_detail(&item_id).await.map_err(explain)?;
            print_json(&detail)?;
        }
        Command::Borrow { item_id } => {
            let resp = app.catalog.borrow(&item_id).await.map_err(explain)?;
            print_json(&resp)?;
        }
        Command::Return { borrow_book_id } => {
            let resp = app.catalog.release(&borrow_book_id).await.map_err(explain)?;
            print_json(&resp)?;
        }
        Command::Download { item_ids } => download_all(app, item_ids).await?,
        Command::Library => {
            let books = app.library.scan().await;
            if books.is_empty() {
                println!("书库为空：{}", app.library.books_dir().display());
            }
            for b in books {
                println!(
                    "{:<5} {}  {}  [{}]",
                    b.format,
                    b.title,
                    b.author.as_deref().unwrap_or("-"),
                    b.path.display()
                );
            }
        }
    }
    Ok(())
}

async fn download_all(app: &App, item_ids: Vec<String>) -> Result<()> {
    let bars = CliBars::new();
    let mut jobs = Vec::new();
    let mut failed = 0usize;

    for id in item_ids {
        let (tx, bar) = bars.track(&id);
        match app.queue.enqueue(&id, Some(tx)) {
            Ok(handle) => jobs.push((handle, bar)),
            Err(e) => {
                failed += 1;
                let _ = bar.await;
                eprintln!("{id}: {e}");
            }
        }
    }

    let interrupt = {
        let queue = app.queue.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(target: "queue", "收到中断信号，正在取消全部任务");
                for s in queue.status().into_iter().filter(|s| s.state.is_running()) {
                    info!(
                        target: "queue",
                        "取消 {}（{}，{}%）",
                        s.item_id,
                        s.state.label(),
                        s.percentage
                    );
                }
                queue.cancel_all();
            }
        })
    };

    let mut results = Vec::new();
    for (handle, bar) in jobs {
        let id = handle.item_id().to_string();
        let result = handle.wait().await;
        let _ = bar.await;
        results.push((id, result));
    }
    interrupt.abort();

    for (id, result) in results {
        match result {
            Ok(file) if file.reused => println!("{id}: 已存在 {}", file.file_name),
            Ok(file) => println!("{id}: 完成 {}", file.path.display()),
            Err(e) => {
                failed += 1;
                eprintln!("{id}: {}", explain(e));
            }
        }
    }
    info!(target: "queue", "下载结束，失败 {failed} 个");
    if failed > 0 {
        return Err(anyhow!("{failed} 个任务未完成"));
    }
    Ok(())
}
