//! Per-site crawl profiles.
//!
//! Every supported target is described by data: how its listing units are
//! generated, which transport it needs by default, and the selector chains
//! for its listing and detail pages. Adding a site means adding a profile,
//! not a new crawl loop.
//!
//! | Target | Listing units | Transport |
//! |--------|---------------|-----------|
//! | `dss` | one ScienceDirect volume per unit | browser |
//! | `iam`, `jsis` | ScienceDirect volume × issue | browser |
//! | `isr` | INFORMS volume × issue | browser |
//! | `misq`, `jais` | AIS eLibrary volume × issue | http |
//! | `jmis` | Taylor & Francis volume × issue | browser |
//! | `theverge` | monthly archive of a section | http |
//! | `techcrunch` | category pages `1..=N` | http |

use chrono::{Datelike, NaiveDate};
use clap::ValueEnum;
use regex::Regex;

use crate::detail::{DetailRules, Extract, FieldChain, LdField, ListChain, ListExtract};
use crate::error::{CrawlError, CrawlResult};
use crate::listing::{HrefSource, LabelFilter, LinkRules};
use crate::models::ListingReference;
use crate::orchestrator::CrawlPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Target {
    Dss,
    Iam,
    Jsis,
    Isr,
    Misq,
    Jais,
    Jmis,
    Theverge,
    Techcrunch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Http,
    Browser,
}

/// How a site's listing units are enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitScheme {
    /// One unit per volume; `{vol}` in the template.
    Volume { template: &'static str },
    /// One unit per volume and issue; `{vol}` and `{iss}` in the template.
    VolumeIssue { template: &'static str },
    /// One unit per calendar month; `{section}`, `{year}`, `{month}`, `{page}`.
    MonthlyArchive {
        template: &'static str,
        default_section: &'static str,
    },
    /// A single unit spanning pages `1..=N`; `{page}` in the template.
    Pages {
        template: &'static str,
        default_pages: u32,
    },
}

/// Static description of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteProfile {
    pub target: Target,
    pub name: &'static str,
    pub transport: TransportKind,
    pub units: UnitScheme,
    pub default_volumes: Option<(u32, u32)>,
    pub default_issues: &'static [u32],
}

/// Unit selection from the command line. Everything is optional; missing
/// values fall back to the profile's defaults.
#[derive(Debug, Clone, Default)]
pub struct UnitArgs {
    pub volumes: Option<String>,
    pub issues: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub section: Option<String>,
    pub pages: Option<u32>,
}

const SCIENCEDIRECT_ITEM: &str = "span.js-article-title.text-l";
const SCIENCEDIRECT_CONSENT: &str = "#onetrust-accept-btn-handler";
const DSS_BASE_VOLUME: i64 = 164;
const DSS_BASE_YEAR: i64 = 2023;

const VERGE_ARTICLE_HREF: &str = r"^(/|https?://www\.theverge\.com/)(\d{4}/\d{1,2}/\d{1,2}/|news/|tech/|ai-artificial-intelligence/|column/|podcast/|video/)";
const TECHCRUNCH_ITEM: &str =
    ".wp-block-post-template.is-layout-flow.wp-block-post-template-is-layout-flow > li";

pub fn profile(target: Target) -> SiteProfile {
    use Target::*;
    use TransportKind::*;
    match target {
        Dss => SiteProfile {
            target,
            name: "Decision Support Systems",
            transport: Browser,
            units: UnitScheme::Volume {
                template: "https://www.sciencedirect.com/journal/decision-support-systems/vol/{vol}/suppl/C",
            },
            default_volumes: Some((164, 199)),
            default_issues: &[],
        },
        Iam => SiteProfile {
            target,
            name: "Information & Management",
            transport: Browser,
            units: UnitScheme::VolumeIssue {
                template: "https://www.sciencedirect.com/journal/information-and-management/vol/{vol}/issue/{iss}",
            },
            default_volumes: Some((62, 62)),
            default_issues: &[1, 2, 3, 4, 5, 6, 7, 8],
        },
        Jsis => SiteProfile {
            target,
            name: "Journal of Strategic Information Systems",
            transport: Browser,
            units: UnitScheme::VolumeIssue {
                template: "https://www.sciencedirect.com/journal/the-journal-of-strategic-information-systems/vol/{vol}/issue/{iss}",
            },
            default_volumes: Some((34, 34)),
            default_issues: &[1, 2, 3, 4],
        },
        Isr => SiteProfile {
            target,
            name: "Information Systems Research",
            transport: Browser,
            units: UnitScheme::VolumeIssue {
                template: "https://pubsonline.informs.org/toc/isre/{vol}/{iss}",
            },
            default_volumes: Some((34, 36)),
            default_issues: &[1, 2, 3, 4],
        },
        Misq => SiteProfile {
            target,
            name: "MIS Quarterly",
            transport: Http,
            units: UnitScheme::VolumeIssue {
                template: "https://aisel.aisnet.org/misq/vol{vol}/iss{iss}/",
            },
            default_volumes: Some((47, 49)),
            default_issues: &[1, 2, 3, 4],
        },
        Jais => SiteProfile {
            target,
            name: "Journal of the Association for Information Systems",
            transport: Http,
            units: UnitScheme::VolumeIssue {
                template: "https://aisel.aisnet.org/jais/vol{vol}/iss{iss}/",
            },
            default_volumes: Some((24, 26)),
            default_issues: &[1, 2, 3, 4, 5, 6],
        },
        Jmis => SiteProfile {
            target,
            name: "Journal of Management Information Systems",
            transport: Browser,
            units: UnitScheme::VolumeIssue {
                template: "https://www.tandfonline.com/toc/mmis20/{vol}/{iss}?nav=tocList",
            },
            default_volumes: Some((40, 42)),
            default_issues: &[1, 2, 3, 4],
        },
        Theverge => SiteProfile {
            target,
            name: "The Verge",
            transport: Http,
            units: UnitScheme::MonthlyArchive {
                template: "https://www.theverge.com/archives/{section}/{year}/{month}/{page}",
                default_section: "ai-artificial-intelligence",
            },
            default_volumes: None,
            default_issues: &[],
        },
        Techcrunch => SiteProfile {
            target,
            name: "TechCrunch",
            transport: Http,
            units: UnitScheme::Pages {
                template: "https://techcrunch.com/category/artificial-intelligence/page/{page}/",
                default_pages: 20,
            },
            default_volumes: None,
            default_issues: &[],
        },
    }
}

/// Publication month of a DSS volume. Volume 164 is January 2023 and every
/// volume after it advances one month.
pub fn dss_date_for_volume(volume: u32) -> String {
    let months = (DSS_BASE_YEAR * 12) + (i64::from(volume) - DSS_BASE_VOLUME);
    format!("{}-{:02}", months.div_euclid(12), months.rem_euclid(12) + 1)
}

/// Parse `A-B` (or a single `A`) into an inclusive range.
pub fn parse_volume_range(raw: &str) -> CrawlResult<(u32, u32)> {
    let bad = || CrawlError::Config(format!("invalid volume range {raw:?}; expected A-B"));
    let (from, to) = match raw.split_once('-') {
        Some((a, b)) => (a.trim(), b.trim()),
        None => (raw.trim(), raw.trim()),
    };
    let from: u32 = from.parse().map_err(|_| bad())?;
    let to: u32 = to.parse().map_err(|_| bad())?;
    if from > to {
        return Err(bad());
    }
    Ok((from, to))
}

/// Parse a comma separated issue list such as `1,2,4`.
pub fn parse_issue_list(raw: &str) -> CrawlResult<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| CrawlError::Config(format!("invalid issue {s:?} in {raw:?}")))
        })
        .collect::<CrawlResult<Vec<_>>>()
        .and_then(|issues| {
            if issues.is_empty() {
                Err(CrawlError::Config("issue list is empty".to_string()))
            } else {
                Ok(issues)
            }
        })
}

fn parse_date(raw: &str, flag: &str) -> CrawlResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| CrawlError::Config(format!("{flag} {raw:?} is not YYYY-MM-DD: {e}")))
}

/// `(year, month)` pairs from `start`'s month through `end`'s month.
pub fn months_between(start: NaiveDate, end: NaiveDate) -> Vec<(i32, u32)> {
    let mut out = Vec::new();
    let (mut year, mut month) = (start.year(), start.month());
    while (year, month) <= (end.year(), end.month()) {
        out.push((year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    out
}

impl SiteProfile {
    /// Enumerate the listing units selected by `args`.
    pub fn units(&self, args: &UnitArgs) -> CrawlResult<Vec<ListingReference>> {
        match self.units {
            UnitScheme::Volume { template } => {
                let (from, to) = self.volume_range(args)?;
                Ok((from..=to)
                    .map(|vol| {
                        let mut unit = ListingReference::single(
                            format!("vol {vol}"),
                            template.replace("{vol}", &vol.to_string()),
                        );
                        unit.volume = Some(vol.to_string());
                        if self.target == Target::Dss {
                            unit.date_hint = Some(dss_date_for_volume(vol));
                        }
                        unit
                    })
                    .collect())
            }
            UnitScheme::VolumeIssue { template } => {
                let (from, to) = self.volume_range(args)?;
                let issues = match &args.issues {
                    Some(raw) => parse_issue_list(raw)?,
                    None => self.default_issues.to_vec(),
                };
                let mut units = Vec::new();
                for vol in from..=to {
                    for iss in &issues {
                        let mut unit = ListingReference::single(
                            format!("vol {vol} / iss {iss}"),
                            template
                                .replace("{vol}", &vol.to_string())
                                .replace("{iss}", &iss.to_string()),
                        );
                        unit.volume = Some(vol.to_string());
                        unit.issue = Some(iss.to_string());
                        units.push(unit);
                    }
                }
                Ok(units)
            }
            UnitScheme::MonthlyArchive {
                template,
                default_section,
            } => {
                let (Some(start), Some(end)) = (&args.start, &args.end) else {
                    return Err(CrawlError::Config(format!(
                        "{} needs --start and --end (YYYY-MM-DD)",
                        self.name
                    )));
                };
                let start = parse_date(start, "--start")?;
                let end = parse_date(end, "--end")?;
                if start > end {
                    return Err(CrawlError::Config("--start is after --end".to_string()));
                }
                let section = args.section.as_deref().unwrap_or(default_section);
                Ok(months_between(start, end)
                    .into_iter()
                    .map(|(year, month)| ListingReference {
                        label: format!("{year}-{month:02}"),
                        url_template: template
                            .replace("{section}", section)
                            .replace("{year}", &year.to_string())
                            .replace("{month}", &month.to_string()),
                        volume: None,
                        issue: None,
                        date_hint: None,
                        fixed_pages: None,
                    })
                    .collect())
            }
            UnitScheme::Pages {
                template,
                default_pages,
            } => {
                let pages = args.pages.unwrap_or(default_pages);
                if pages == 0 {
                    return Err(CrawlError::Config("--pages must be at least 1".to_string()));
                }
                Ok(vec![ListingReference {
                    label: format!("pages 1-{pages}"),
                    url_template: template.to_string(),
                    volume: None,
                    issue: None,
                    date_hint: None,
                    fixed_pages: Some(pages),
                }])
            }
        }
    }

    fn volume_range(&self, args: &UnitArgs) -> CrawlResult<(u32, u32)> {
        match (&args.volumes, self.default_volumes) {
            (Some(raw), _) => parse_volume_range(raw),
            (None, Some(range)) => Ok(range),
            (None, None) => Err(CrawlError::Config(format!("{} needs --volumes A-B", self.name))),
        }
    }

    /// Listing and detail rules for this site.
    pub fn plan(&self) -> CrawlResult<CrawlPlan> {
        let plan = match self.target {
            Target::Dss | Target::Iam | Target::Jsis => sciencedirect_plan(self.target != Target::Dss),
            Target::Isr => informs_plan(),
            Target::Misq => aisel_plan("misq"),
            Target::Jais => aisel_plan("jais"),
            Target::Jmis => tandf_plan(),
            Target::Theverge => verge_plan()?,
            Target::Techcrunch => techcrunch_plan(),
        };
        Ok(plan)
    }
}

fn sciencedirect_plan(with_page_date: bool) -> CrawlPlan {
    let mut links = LinkRules::new(SCIENCEDIRECT_ITEM);
    links.keep_unlinked = true;
    links.ready = Some(SCIENCEDIRECT_ITEM.to_string());

    // DSS dates come from the volume number instead.
    let date = if with_page_date {
        FieldChain(vec![
            Extract::Attr {
                selector: "meta[name='citation_publication_date']",
                attr: "content",
            },
            Extract::Text("div.text-xs, dl.article-header-details"),
        ])
    } else {
        FieldChain::default()
    };

    CrawlPlan {
        links,
        click_selector: SCIENCEDIRECT_ITEM.to_string(),
        detail_ready: Some("span.title-text".to_string()),
        detail: DetailRules {
            title: FieldChain(vec![Extract::Text("span.title-text")]),
            authors: ListChain(vec![ListExtract::Each(
                "div.author-group span.react-xocs-alternative-link",
            )]),
            abstract_text: FieldChain(vec![
                Extract::Text("div.abstract.author"),
                Extract::Text("div[id^='sp']"),
                Extract::Text("div.Abstracts div.abstract"),
            ]),
            keywords: ListChain(vec![
                ListExtract::Each("div.keywords-section div.keyword > span"),
                ListExtract::Each("div.Keywords div.keyword"),
            ]),
            date,
        },
        consent: Some(SCIENCEDIRECT_CONSENT.to_string()),
    }
}

fn informs_plan() -> CrawlPlan {
    let item = "h5.issue-item__title > a";
    let mut links = LinkRules::new(item);
    links.ready = Some(item.to_string());
    CrawlPlan {
        links,
        click_selector: item.to_string(),
        detail_ready: Some("h1.citation__title".to_string()),
        detail: DetailRules {
            title: FieldChain(vec![Extract::Text("h1.citation__title")]),
            authors: ListChain(vec![ListExtract::Each("a.entryAuthor")]),
            abstract_text: FieldChain(vec![Extract::Text("div.abstractSection.abstractInFull > p")]),
            keywords: ListChain(vec![ListExtract::Each("section.article__keyword ul.rlist li a")]),
            date: FieldChain(vec![Extract::Text("span.epub-section__date")]),
        },
        consent: Some("#hs-eu-confirmation-button".to_string()),
    }
}

fn aisel_plan(journal: &str) -> CrawlPlan {
    let mut links = LinkRules::new("a[href]");
    links.href_template = Some(format!(r"/{journal}/vol{{volume}}/iss{{issue}}/\d+/?$"));
    CrawlPlan {
        links,
        click_selector: "a[href]".to_string(),
        detail_ready: None,
        detail: DetailRules {
            title: FieldChain(vec![Extract::Text("#title a"), Extract::Text("#title")]),
            authors: ListChain(vec![
                ListExtract::Each("#authors strong"),
                ListExtract::Each("#authors a"),
            ]),
            abstract_text: FieldChain(vec![
                Extract::Text("#abstract p"),
                Extract::AfterHeading {
                    heading: "abstract",
                    next: "p",
                },
            ]),
            keywords: ListChain(vec![
                ListExtract::Each(
                    "div.keywords li, div.keywords span, div.keywords a, \
                     section.keywords li, section.keywords span, section.keywords a, \
                     #keywords li, #keywords span, #keywords a",
                ),
                ListExtract::SplitAttr {
                    selector: "meta[name='keywords']",
                    attr: "content",
                },
            ]),
            date: FieldChain(vec![Extract::Attr {
                selector: "meta[name='bepress_citation_date']",
                attr: "content",
            }]),
        },
        consent: None,
    }
}

fn tandf_plan() -> CrawlPlan {
    let item = "div.art_title.linkable > a";
    let mut links = LinkRules::new(item);
    links.ready = Some(item.to_string());
    CrawlPlan {
        links,
        click_selector: item.to_string(),
        detail_ready: Some(".hlFld-title".to_string()),
        detail: DetailRules {
            title: FieldChain(vec![Extract::Text(".hlFld-title")]),
            authors: ListChain(vec![ListExtract::Each("a.author")]),
            abstract_text: FieldChain(vec![Extract::Text(".last")]),
            keywords: ListChain(vec![ListExtract::Each(".keyword-click")]),
            date: FieldChain(vec![Extract::Attr {
                selector: "meta[name='dc.Date']",
                attr: "content",
            }]),
        },
        consent: Some("#onetrust-accept-btn-handler".to_string()),
    }
}

fn verge_plan() -> CrawlResult<CrawlPlan> {
    let mut links = LinkRules::new("a[href]");
    links.href_pattern = Some(
        Regex::new(VERGE_ARTICLE_HREF)
            .map_err(|e| CrawlError::Config(format!("article href pattern: {e}")))?,
    );
    Ok(CrawlPlan {
        links,
        click_selector: "a[href]".to_string(),
        detail_ready: None,
        detail: DetailRules {
            title: FieldChain(vec![Extract::JsonLd(LdField::Headline), Extract::Text("h1")]),
            authors: ListChain(vec![ListExtract::SplitAttr {
                selector: "meta[name='author']",
                attr: "content",
            }]),
            abstract_text: FieldChain(vec![
                Extract::JsonLd(LdField::Description),
                Extract::Attr {
                    selector: "meta[name='description']",
                    attr: "content",
                },
                Extract::Attr {
                    selector: "meta[property='og:description']",
                    attr: "content",
                },
                Extract::Attr {
                    selector: "meta[name='twitter:description']",
                    attr: "content",
                },
                Extract::JoinedText {
                    selector: "article p",
                    sep: " ",
                    limit: Some(5),
                },
                Extract::JoinedText {
                    selector: "p",
                    sep: " ",
                    limit: Some(5),
                },
            ]),
            keywords: ListChain(vec![
                ListExtract::JsonLdKeywords,
                ListExtract::SplitAttr {
                    selector: "meta[name='news_keywords']",
                    attr: "content",
                },
                ListExtract::SplitAttr {
                    selector: "meta[name='keywords']",
                    attr: "content",
                },
                ListExtract::Each("#zephr-anchor ul li"),
            ]),
            date: FieldChain(vec![
                Extract::JsonLd(LdField::DatePublished),
                Extract::Attr {
                    selector: "time[datetime]",
                    attr: "datetime",
                },
                Extract::Text("time"),
            ]),
        },
        consent: None,
    })
}

fn techcrunch_plan() -> CrawlPlan {
    let mut links = LinkRules::new(TECHCRUNCH_ITEM);
    links.href_from = HrefSource::Descendant("div > div > div > h3 > a".to_string());
    links.require_label = Some(LabelFilter {
        selector: "div > div > div > div > a".to_string(),
        text: "AI".to_string(),
    });
    CrawlPlan {
        links,
        click_selector: TECHCRUNCH_ITEM.to_string(),
        detail_ready: None,
        detail: DetailRules {
            title: FieldChain(vec![Extract::Text(".article-hero__title.wp-block-post-title")]),
            authors: ListChain(vec![ListExtract::Each(".wp-block-tc23-author-card-name a")]),
            abstract_text: FieldChain(vec![Extract::JoinedText {
                selector: ".entry-content.wp-block-post-content.is-layout-constrained.wp-block-post-content-is-layout-constrained > p",
                sep: " ",
                limit: None,
            }]),
            keywords: ListChain(vec![ListExtract::Each(".wp-block-tc23-post-relevant-terms > div")]),
            date: FieldChain(vec![Extract::Attr {
                selector: ".wp-block-post-date > time",
                attr: "datetime",
            }]),
        },
        consent: None,
    }
}
