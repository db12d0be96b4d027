//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。相对路径均以数据目录为基准解析。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 路径配置
    #[serde(default = "default_books_dir")]
    pub books_dir: String,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    #[serde(default = "default_token_file")]
    pub token_file: String,
    #[serde(default = "default_cache_file")]
    pub cache_file: String,
    #[serde(default = "default_document_tool")]
    pub document_tool: String,

    // 下载配置
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_true")]
    pub save_cover: bool,
    #[serde(default = "default_true")]
    pub archive_password_sha512: bool,

    // 网络配置
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_token_refresh_margin")]
    pub token_refresh_margin: u64,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_agent_base_url")]
    pub agent_base_url: String,
    #[serde(default = "default_web_origin")]
    pub web_origin: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_organization_id")]
    pub default_organization_id: String,

    // 缓存配置
    #[serde(default = "default_search_cache_ttl")]
    pub search_cache_ttl: u64,
    #[serde(default = "default_detail_cache_ttl")]
    pub detail_cache_ttl: u64,
    #[serde(default = "default_search_page_size")]
    pub search_page_size: usize,

    #[serde(skip)]
    pub(crate) base_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            books_dir: default_books_dir(),
            temp_dir: default_temp_dir(),
            token_file: default_token_file(),
            cache_file: default_cache_file(),
            document_tool: default_document_tool(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            save_cover: default_true(),
            archive_password_sha512: default_true(),
            request_timeout: default_request_timeout(),
            token_refresh_margin: default_token_refresh_margin(),
            api_base_url: default_api_base_url(),
            agent_base_url: default_agent_base_url(),
            web_origin: default_web_origin(),
            user_agent: default_user_agent(),
            default_organization_id: default_organization_id(),
            search_cache_ttl: default_search_cache_ttl(),
            detail_cache_ttl: default_detail_cache_ttl(),
            search_page_size: default_search_page_size(),
            base_dir: None,
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 18] = [
            FieldMeta {
                name: "books_dir",
                description: "解密后书籍的保存目录（相对数据目录）",
            },
            FieldMeta {
                name: "temp_dir",
                description: "下载中间文件目录",
            },
            FieldMeta {
                name: "token_file",
                description: "登录凭据文件路径",
            },
            FieldMeta {
                name: "cache_file",
                description: "接口响应缓存文件路径",
            },
            FieldMeta {
                name: "document_tool",
                description: "PDF 保护移除工具（qpdf）路径，可填绝对路径或 PATH 中的命令名",
            },
            FieldMeta {
                name: "max_concurrent_downloads",
                description: "同时进行的下载任务数",
            },
            FieldMeta {
                name: "save_cover",
                description: "是否同时保存封面图片 cover.jpg",
            },
            FieldMeta {
                name: "archive_password_sha512",
                description: "容器密码使用 SHA-512 派生（false 时使用 SHA-1）",
            },
            FieldMeta {
                name: "request_timeout",
                description: "API 请求超时时间（秒）；文件下载只限制建立连接的时间",
            },
            FieldMeta {
                name: "token_refresh_margin",
                description: "访问令牌到期前提前刷新的秒数",
            },
            FieldMeta {
                name: "api_base_url",
                description: "借阅服务 API 根地址",
            },
            FieldMeta {
                name: "agent_base_url",
                description: "借阅服务 agent 接口根地址（借书接口）",
            },
            FieldMeta {
                name: "web_origin",
                description: "请求头 Origin/Referer 使用的站点地址",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求头 User-Agent",
            },
            FieldMeta {
                name: "default_organization_id",
                description: "书籍详情与借阅馆均未给出机构 ID 时使用的默认值",
            },
            FieldMeta {
                name: "search_cache_ttl",
                description: "搜索结果缓存时间（秒）",
            },
            FieldMeta {
                name: "detail_cache_ttl",
                description: "书籍详情缓存时间（秒）",
            },
            FieldMeta {
                name: "search_page_size",
                description: "每页搜索结果数量",
            },
        ];
        &FIELDS
    }
}

impl Config {
    /// 设置数据目录，相对路径将以此为基准。
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw.trim());
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir().join(p)
        }
    }

    pub fn books_path(&self) -> PathBuf {
        self.resolve(&self.books_dir)
    }

    pub fn temp_path(&self) -> PathBuf {
        self.resolve(&self.temp_dir)
    }

    pub fn token_path(&self) -> PathBuf {
        self.resolve(&self.token_file)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.resolve(&self.cache_file)
    }

    pub fn logs_path(&self) -> PathBuf {
        self.base_dir().join("logs")
    }

    /// 工具路径含目录分隔符时按数据目录解析，否则交给 PATH 查找。
    pub fn document_tool_path(&self) -> PathBuf {
        let raw = self.document_tool.trim();
        if raw.contains('/') || raw.contains('\\') {
            self.resolve(raw)
        } else {
            PathBuf::from(raw)
        }
    }

    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_cache_ttl)
    }

    pub fn detail_ttl(&self) -> Duration {
        Duration::from_secs(self.detail_cache_ttl)
    }
}

fn default_true() -> bool {
    true
}

fn default_books_dir() -> String {
    "books".to_string()
}

fn default_temp_dir() -> String {
    "temp".to_string()
}

fn default_token_file() -> String {
    "tokens/token.json".to_string()
}

fn default_cache_file() -> String {
    "temp/cache.json".to_string()
}

fn default_document_tool() -> String {
    if cfg!(windows) {
        "bin/qpdf.exe".to_string()
    } else {
        "qpdf".to_string()
    }
}

fn default_max_concurrent_downloads() -> usize {
    2
}

fn default_request_timeout() -> u64 {
    60
}

fn default_token_refresh_margin() -> u64 {
    60
}

fn default_api_base_url() -> String {
    "https://api2-ipusnas.perpusnas.go.id/api".to_string()
}

fn default_agent_base_url() -> String {
    "https://api2-ipusnas.perpusnas.go.id/agent".to_string()
}

fn default_web_origin() -> String {
    "https://ipusnas2.perpusnas.go.id".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.0.0 Mobile Safari/537.36".to_string()
}

fn default_organization_id() -> String {
    "1fe99d3c-b272-40cd-8d9c-a4871f4eaef2".to_string()
}

fn default_search_cache_ttl() -> u64 {
    5 * 60
}

fn default_detail_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_search_page_size() -> usize {
    25
}
