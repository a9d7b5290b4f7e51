use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::error::{AppResult, BrowserError};

/// 连接到已开启远程调试端口的浏览器，并找到门户页面
///
/// 优先复用 URL 以 `portal_url` 开头的已有标签页（操作员可能已经登录）；
/// 找不到时新建标签页并导航过去。
pub async fn connect_to_browser_and_page(port: u16, portal_url: &str) -> AppResult<(Browser, Page)> {
    let browser_url = format!("http://localhost:{}", port);
    info!("正在连接到浏览器: {}", browser_url);

    let (browser, mut handler) = Browser::connect(&browser_url).await.map_err(|e| {
        error!("连接浏览器失败: {}", e);
        BrowserError::ConnectionFailed {
            port,
            source: Box::new(e),
        }
    })?;
    debug!("浏览器连接成功");

    // 在后台处理浏览器事件
    tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    // 等待浏览器状态同步
    sleep(tokio::time::Duration::from_millis(300)).await;

    let pages = browser.pages().await?;
    debug!("获取到 {} 个页面", pages.len());

    let origin = portal_origin(portal_url);
    for p in pages.iter() {
        if let Ok(Some(url)) = p.url().await {
            debug!("检查页面: {}", url);
            if url.starts_with(origin) {
                info!("✓ 复用已打开的门户页面: {}", url);
                return Ok((browser, p.clone()));
            }
        }
    }

    debug!("未找到门户页面，新建标签页: {}", portal_url);
    let page = browser.new_page("about:blank").await.map_err(|e| {
        error!("创建新页面失败: {}", e);
        e
    })?;
    page.goto(portal_url).await.map_err(|e| {
        error!("导航到 {} 失败: {}", portal_url, e);
        e
    })?;
    info!("已导航到: {}", portal_url);

    Ok((browser, page))
}

/// `https://host/path?x` → `https://host`
fn portal_origin(url: &str) -> &str {
    let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[after_scheme..].find('/') {
        Some(i) => &url[..after_scheme + i],
        None => url,
    }
}
